//! Keyword rule tables for reply sentiment and proposal detection.
//!
//! Rules are ordered pattern → effect entries so the lexicons can be tested
//! and swapped independently of the state machine.

use std::sync::LazyLock;

use regex::Regex;

/// Effect of a sentiment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

/// Sentiment of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    /// Number of distinct positive rules that matched.
    Positive(u32),
    Negative,
    Neutral,
}

/// A single keyword rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct SentimentRule {
    pub regex: Regex,
    pub polarity: Polarity,
}

/// Negative phrases. Checked before positives, so "not interested" never
/// scores as interest.
const NEGATIVE_PATTERNS: &[&str] = &[
    r"not\s+interested",
    r"no\s+thanks?",
    r"no\s+thank\s+you",
    r"stop",
    r"unsubscribe",
    r"remove\s+me",
    r"do\s*n[o']?t\s+(contact|call|text|email)",
    r"leave\s+me\s+alone",
    r"wrong\s+number",
    r"not\s+a\s+(good\s+)?fit",
    r"already\s+(have|using|signed)",
    r"go\s+away",
];

const POSITIVE_PATTERNS: &[&str] = &[
    r"interested",
    r"yes",
    r"sounds\s+(good|great)",
    r"tell\s+me\s+more",
    r"let'?s\s+(talk|chat|meet)",
    r"call\s+me",
    r"schedule",
    r"book",
    r"demo",
    r"pric(e|ing)",
    r"quote",
    r"how\s+much",
    r"available",
    r"love\s+to",
    r"great",
];

/// Outbound content that signals a proposal or booking step.
const PROPOSAL_PATTERNS: &[&str] = &[
    r"proposal",
    r"quote",
    r"pricing",
    r"estimate",
    r"book\s+a",
    r"schedule\s+a",
    r"calendar",
    r"meeting\s+link",
    r"demo",
];

/// Built-in lexicon entries are literals; a bad one is a programming error.
fn compile(pattern: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{pattern})\b")).unwrap()
}

/// Ordered sentiment rules.
pub struct SentimentRules {
    rules: Vec<SentimentRule>,
}

impl SentimentRules {
    /// Built-in lexicons: negatives first, then positives.
    pub fn default_rules() -> Self {
        let negative = NEGATIVE_PATTERNS.iter().map(|p| SentimentRule {
            regex: compile(p),
            polarity: Polarity::Negative,
        });
        let positive = POSITIVE_PATTERNS.iter().map(|p| SentimentRule {
            regex: compile(p),
            polarity: Polarity::Positive,
        });
        Self {
            rules: negative.chain(positive).collect(),
        }
    }

    pub fn with_rules(rules: Vec<SentimentRule>) -> Self {
        Self { rules }
    }

    /// Any negative match wins; otherwise count positive matches.
    pub fn classify(&self, text: &str) -> Sentiment {
        let mut positive = 0;
        for rule in &self.rules {
            if !rule.regex.is_match(text) {
                continue;
            }
            match rule.polarity {
                Polarity::Negative => return Sentiment::Negative,
                Polarity::Positive => positive += 1,
            }
        }
        if positive > 0 {
            Sentiment::Positive(positive)
        } else {
            Sentiment::Neutral
        }
    }
}

static PROPOSAL_RULES: LazyLock<Vec<Regex>> =
    LazyLock::new(|| PROPOSAL_PATTERNS.iter().map(|p| compile(p)).collect());

/// Whether outbound content reads like a proposal or booking push.
pub fn mentions_proposal(text: &str) -> bool {
    PROPOSAL_RULES.iter().any(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        let rules = SentimentRules::default_rules();
        assert_eq!(
            rules.rules.len(),
            NEGATIVE_PATTERNS.len() + POSITIVE_PATTERNS.len()
        );
        assert_eq!(PROPOSAL_RULES.len(), PROPOSAL_PATTERNS.len());
    }

    #[test]
    fn negative_beats_positive() {
        let rules = SentimentRules::default_rules();
        assert_eq!(
            rules.classify("not interested, please stop"),
            Sentiment::Negative
        );
        assert_eq!(rules.classify("Please STOP texting"), Sentiment::Negative);
        assert_eq!(rules.classify("don't call me again"), Sentiment::Negative);
    }

    #[test]
    fn positive_score_counts_matches() {
        let rules = SentimentRules::default_rules();
        assert_eq!(rules.classify("Yes!"), Sentiment::Positive(1));
        assert_eq!(
            rules.classify("Yes, I'm interested. What's the pricing?"),
            Sentiment::Positive(3)
        );
    }

    #[test]
    fn neutral_when_nothing_matches() {
        let rules = SentimentRules::default_rules();
        assert_eq!(rules.classify("Who is this?"), Sentiment::Neutral);
    }

    #[test]
    fn word_boundaries_respected() {
        let rules = SentimentRules::default_rules();
        // "bookkeeping" is not "book", "stopwatch" is not "stop".
        assert_eq!(rules.classify("I do bookkeeping"), Sentiment::Neutral);
        assert_eq!(rules.classify("my stopwatch broke"), Sentiment::Neutral);
    }

    #[test]
    fn proposal_detection() {
        assert!(mentions_proposal("Here is the proposal we discussed"));
        assert!(mentions_proposal("Want to book a quick call?"));
        assert!(!mentions_proposal("Hope your week is going well"));
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let rules = SentimentRules::with_rules(vec![SentimentRule {
            regex: Regex::new("(?i)banana").unwrap(),
            polarity: Polarity::Positive,
        }]);
        assert_eq!(rules.classify("banana"), Sentiment::Positive(1));
        assert_eq!(rules.classify("yes"), Sentiment::Neutral);
    }
}
