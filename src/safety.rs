//! Content-safety screening of user-visible prompt text.

use crate::config::SafetySettings;
use crate::error::RelayError;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub reason: String,
    pub code: String,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: String::new(),
            code: String::new(),
        }
    }

    pub fn blocked(reason: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: reason.into(),
            code: code.into(),
        }
    }

    /// `Err(ContentBlocked)` for an unsafe verdict.
    pub fn into_result(self) -> Result<(), RelayError> {
        if self.safe {
            Ok(())
        } else {
            Err(RelayError::blocked(self.reason, self.code))
        }
    }
}

pub trait ContentChecker: Send + Sync {
    fn check(&self, text: &str) -> SafetyVerdict;
}

pub type SharedChecker = Arc<dyn ContentChecker>;

/// Case-insensitive substring match against a configured word list.
#[derive(Debug, Clone, Default)]
pub struct KeywordChecker {
    words: Vec<String>,
}

impl KeywordChecker {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// `None` when screening is switched off.
    pub fn from_settings(settings: &SafetySettings) -> Option<Self> {
        settings.enabled.then(|| Self::new(&settings.blocked_words))
    }
}

impl ContentChecker for KeywordChecker {
    fn check(&self, text: &str) -> SafetyVerdict {
        let haystack = text.to_lowercase();
        match self.words.iter().find(|w| haystack.contains(w.as_str())) {
            Some(word) => SafetyVerdict::blocked(
                format!("request contains blocked content: {word}"),
                "sensitive_words_detected",
            ),
            None => SafetyVerdict::safe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let checker = KeywordChecker::new(["Forbidden", "  "]);
        assert!(checker.check("all good").safe);

        let verdict = checker.check("this is FORBIDDEN text");
        assert!(!verdict.safe);
        assert_eq!(verdict.code, "sensitive_words_detected");

        let err = verdict.into_result().unwrap_err();
        assert_eq!(err.status().as_u16(), 400);
        assert!(err.is_local());
    }

    #[test]
    fn test_disabled_settings_build_nothing() {
        let settings = SafetySettings {
            enabled: false,
            blocked_words: vec!["x".to_string()],
        };
        assert!(KeywordChecker::from_settings(&settings).is_none());
    }
}
