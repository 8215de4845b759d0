use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZtpError {
    #[error("Watcher error: {0}")]
    Watch(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ZtpError>;
