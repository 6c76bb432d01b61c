//! Exit-intent detection over final speech transcripts.
//!
//! A fixed set of farewell phrases matched case-insensitively. The pattern
//! set is injectable configuration so other locales can be supported without
//! touching the state machine; the default list covers the French-first
//! kiosk deployments plus common English farewells.

/// Final transcripts at or below this length are ignored.
pub const MIN_TRANSCRIPT_CHARS: usize = 3;

/// Default farewell phrases (lowercase).
pub const DEFAULT_EXIT_PATTERNS: &[&str] = &[
    "au revoir",
    "à bientôt",
    "a bientôt",
    "bonne journée",
    "bonne soirée",
    "merci beaucoup",
    "je m'en vais",
    "je dois partir",
    "je vais y aller",
    "c'est tout pour moi",
    "goodbye",
    "bye bye",
    "see you",
    "thanks",
    "i'm leaving",
    "gotta go",
    "have a good day",
];

#[derive(Debug, Clone)]
pub struct ExitIntentDetector {
    patterns: Vec<String>,
}

impl Default for ExitIntentDetector {
    fn default() -> Self {
        Self::new(DEFAULT_EXIT_PATTERNS.iter().map(|p| p.to_string()).collect())
    }
}

impl ExitIntentDetector {
    /// Build a detector from an injected pattern list. Patterns are
    /// lowercased once here so matching stays a plain substring scan.
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Whether a final transcript expresses the intent to end the session.
    pub fn matches(&self, transcript: &str) -> bool {
        if transcript.chars().count() <= MIN_TRANSCRIPT_CHARS {
            return false;
        }
        let text = transcript.to_lowercase();
        self.patterns.iter().any(|p| text.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_french_farewell() {
        let detector = ExitIntentDetector::default();
        assert!(detector.matches("Bon, merci beaucoup, au revoir !"));
        assert!(detector.matches("Je dois partir maintenant"));
        assert!(detector.matches("À BIENTÔT"));
    }

    #[test]
    fn ignores_ordinary_requests() {
        let detector = ExitIntentDetector::default();
        assert!(!detector.matches("je voudrais savoir les horaires"));
        assert!(!detector.matches("quels cours demain matin ?"));
    }

    #[test]
    fn ignores_short_transcripts() {
        let detector = ExitIntentDetector::default();
        // At or below the minimal length, even a farewell is ignored.
        assert!(!detector.matches("bye"));
        assert!(!detector.matches(""));
    }

    #[test]
    fn custom_pattern_list_replaces_defaults() {
        let detector = ExitIntentDetector::new(vec!["hasta luego".to_string()]);
        assert!(detector.matches("vale, hasta luego"));
        assert!(!detector.matches("au revoir"));
    }
}
