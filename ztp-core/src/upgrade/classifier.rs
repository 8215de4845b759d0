//! Mapping from free-text device output to outcomes.
//!
//! Device output is the only signal the CLI gives us, so every known
//! signature lives in one ordered table instead of being scattered through
//! the sequencer. Prompt signatures are checked before error signatures.

use serde::{Deserialize, Serialize};

use crate::session::SessionError;

use super::TransferOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The device stopped at an interactive question.
    PromptBlocked,
    /// The device reported an error.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRule {
    /// Case-insensitive substring.
    pub needle: String,
    pub verdict: Verdict,
}

impl SignatureRule {
    pub fn new(needle: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            needle: needle.into().to_ascii_lowercase(),
            verdict,
        }
    }
}

pub const DEFAULT_PROMPT_SIGNATURES: &[&str] = &[
    "pattern not detected",
    "destination filename",
    "[confirm]",
    "over write?",
];

pub const DEFAULT_ERROR_SIGNATURES: &[&str] =
    &["error", "timed out", "no such file", "invalid input"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputClassifier {
    rules: Vec<SignatureRule>,
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::with_signatures(
            DEFAULT_PROMPT_SIGNATURES.iter().copied(),
            DEFAULT_ERROR_SIGNATURES.iter().copied(),
        )
    }
}

impl OutputClassifier {
    pub fn with_signatures<P, E, S>(prompts: P, errors: E) -> Self
    where
        P: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rules: Vec<SignatureRule> = prompts
            .into_iter()
            .map(|needle| SignatureRule::new(needle, Verdict::PromptBlocked))
            .collect();
        rules.extend(
            errors
                .into_iter()
                .map(|needle| SignatureRule::new(needle, Verdict::Error)),
        );
        Self { rules }
    }

    /// Add rules on top of the existing table, keeping prompt rules ahead of
    /// error rules.
    pub fn extend<I: IntoIterator<Item = SignatureRule>>(&mut self, extra: I) {
        self.rules.extend(extra.into_iter().filter(|rule| !rule.needle.is_empty()));
        self.rules
            .sort_by_key(|rule| matches!(rule.verdict, Verdict::Error));
    }

    pub fn rules(&self) -> &[SignatureRule] {
        &self.rules
    }

    /// First matching rule for `output`, if any.
    pub fn classify(&self, output: &str) -> Option<&SignatureRule> {
        let haystack = output.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| haystack.contains(rule.needle.as_str()))
    }

    pub fn indicates_error(&self, output: &str) -> bool {
        self.classify(output).is_some()
    }

    /// `dir <fs>:<image>` output with any error indicator means the image is
    /// not on the device.
    pub fn image_present(&self, listing: &str) -> bool {
        !self.indicates_error(listing)
    }

    /// Classify the result of a transfer command. Transport failures are
    /// classified on their rendered message, which carries any partial
    /// output the device sent.
    pub fn transfer_outcome(&self, result: &Result<String, SessionError>) -> TransferOutcome {
        let text = match result {
            Ok(output) => output.clone(),
            Err(err) => err.to_string(),
        };
        match self.classify(&text) {
            None if result.is_ok() => TransferOutcome::Succeeded,
            None => TransferOutcome::Failed(text),
            Some(rule) if rule.verdict == Verdict::PromptBlocked => TransferOutcome::PromptBlocked,
            Some(_) => TransferOutcome::Failed(summarize(&text)),
        }
    }
}

/// Last non-empty line, which is where IOS puts the error text.
fn summarize(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or(text)
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn missing_image_listing_is_an_error() {
        let classifier = OutputClassifier::default();
        assert!(!classifier.image_present(
            "%Error opening flash:/c2960x.bin (No such file or directory)"
        ));
        assert!(classifier.image_present(
            "Directory of flash:/c2960x.bin\n\n\
             \x20 2  -rwx  26789376  Mar 1 1993 00:12:41 +00:00  c2960x.bin"
        ));
    }

    #[test]
    fn clean_transfer_succeeds() {
        let out = Ok("Accessing tftp://10.0.0.1/c2960x.bin...\n\
                      Loading c2960x.bin from 10.0.0.1 (via Vlan1): !!!!!!\n\
                      [OK - 26789376 bytes]\n\
                      26789376 bytes copied in 40.112 secs"
            .to_string());
        assert_eq!(
            OutputClassifier::default().transfer_outcome(&out),
            TransferOutcome::Succeeded
        );
    }

    #[test]
    fn prompt_timeout_is_prompt_blocked() {
        let out = Err(SessionError::PromptTimeout {
            timeout: Duration::from_secs(5),
            partial: "Destination filename [c2960x.bin]?".into(),
        });
        assert_eq!(
            OutputClassifier::default().transfer_outcome(&out),
            TransferOutcome::PromptBlocked
        );
    }

    #[test]
    fn prompt_signature_wins_over_error_signature() {
        let out = Ok("%Error: Destination filename [x.bin]? [confirm]".to_string());
        assert_eq!(
            OutputClassifier::default().transfer_outcome(&out),
            TransferOutcome::PromptBlocked
        );
    }

    #[test]
    fn device_error_is_failed_with_last_line() {
        let out = Ok("Accessing tftp://10.0.0.1/c2960x.bin...\n\
                      %Error opening tftp://10.0.0.1/c2960x.bin (Timed out)"
            .to_string());
        assert_eq!(
            OutputClassifier::default().transfer_outcome(&out),
            TransferOutcome::Failed(
                "%Error opening tftp://10.0.0.1/c2960x.bin (Timed out)".into()
            )
        );
    }

    #[test]
    fn unmatched_transport_failure_is_failed() {
        let out = Err(SessionError::Channel("channel closed by 10.0.0.5:22".into()));
        assert!(matches!(
            OutputClassifier::default().transfer_outcome(&out),
            TransferOutcome::Failed(reason) if reason.contains("channel closed")
        ));
    }

    #[test]
    fn extended_rules_keep_prompt_rules_first() {
        let mut classifier = OutputClassifier::default();
        classifier.extend([
            SignatureRule::new("%Bad", Verdict::Error),
            SignatureRule::new("Proceed with reload?", Verdict::PromptBlocked),
            SignatureRule::new("", Verdict::Error),
        ]);
        let verdicts: Vec<_> = classifier.rules().iter().map(|r| r.verdict).collect();
        let first_error = verdicts.iter().position(|v| *v == Verdict::Error).unwrap();
        assert!(verdicts[first_error..].iter().all(|v| *v == Verdict::Error));
        assert_eq!(
            classifier.classify("Proceed with reload? [confirm]").map(|r| r.verdict),
            Some(Verdict::PromptBlocked)
        );
        assert!(classifier.indicates_error("%bad image"));
        assert!(classifier.rules().iter().all(|rule| !rule.needle.is_empty()));
    }
}
