use regex::Regex;
use sharp_core::Session;
use std::sync::OnceLock;

const DEFAULT_RULES: &[&str] = &[
    r"\?\s*$",
    r"(?i)\blet me know\b",
    r"(?i)\bshould i\b",
    r"(?i)\bwould you like\b",
    r"(?i)\bdo you want\b",
    r"(?i)\bwaiting for\b",
    r"(?i)\bneed your\b",
    r"(?i)\bplease confirm\b",
    r"(?i)\bcan you confirm\b",
    r"(?i)\bwhich (?:one|option)\b",
];

/// Decides whether an assistant message is asking the user for input.
pub trait WaitingPredicate: Send + Sync {
    fn is_waiting(&self, text: &str) -> bool;
}

impl<F> WaitingPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_waiting(&self, text: &str) -> bool {
        self(text)
    }
}

#[derive(Debug, Clone)]
pub struct RegexWaitingPredicate {
    rules: Vec<Regex>,
}

impl RegexWaitingPredicate {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Regex] {
        &self.rules
    }
}

impl Default for RegexWaitingPredicate {
    fn default() -> Self {
        static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
        let rules = RULES.get_or_init(|| {
            DEFAULT_RULES
                .iter()
                .map(|pattern| Regex::new(pattern).expect("valid regex"))
                .collect()
        });
        Self {
            rules: rules.clone(),
        }
    }
}

impl WaitingPredicate for RegexWaitingPredicate {
    fn is_waiting(&self, text: &str) -> bool {
        let text = text.trim();
        !text.is_empty() && self.rules.iter().any(|rule| rule.is_match(text))
    }
}

/// Only the latest message counts, and only when the assistant wrote it.
pub fn latest_assistant_waiting(session: &Session, predicate: &dyn WaitingPredicate) -> bool {
    match session.latest_message() {
        Some(message) if message.is_assistant() => predicate.is_waiting(&message.text()),
        _ => false,
    }
}
