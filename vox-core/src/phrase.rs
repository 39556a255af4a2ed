//! Wake-phrase matching.
//!
//! ## Algorithm
//!
//! 1. Normalize the utterance text exactly as key phrases were normalized.
//! 2. Walk key phrases in configuration order; the first one the text starts
//!    with wins (phrases may overlap, e.g. "hey computer" and "hey").
//! 3. The command text is the remainder with leading separators trimmed.
//!    An empty remainder is still a command.
//! 4. No match → `None`; the caller drops the utterance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::error::{Result, VoxError};
use crate::events::{Command, CommandId, RawUtterance};
use crate::text::normalize;

/// A normalized, non-empty wake phrase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPhrase(String);

impl KeyPhrase {
    /// # Errors
    /// `VoxError::Configuration` if the phrase normalizes to nothing.
    pub fn new(raw: &str) -> Result<Self> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(VoxError::Configuration(format!(
                "key phrase {raw:?} is empty after normalization"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct PhraseMatcher {
    phrases: Vec<KeyPhrase>,
    next_command: AtomicU64,
}

impl PhraseMatcher {
    pub fn new(phrases: Vec<KeyPhrase>) -> Self {
        Self {
            phrases,
            next_command: AtomicU64::new(0),
        }
    }

    /// Build from raw configuration strings.
    pub fn from_phrases<S: AsRef<str>>(raw: &[S]) -> Result<Self> {
        let phrases = raw
            .iter()
            .map(|p| KeyPhrase::new(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(phrases))
    }

    pub fn phrases(&self) -> &[KeyPhrase] {
        &self.phrases
    }

    /// Strip the first matching key phrase and return the remainder.
    pub fn strip<'a>(&self, normalized: &'a str) -> Option<(&KeyPhrase, &'a str)> {
        self.phrases.iter().find_map(|phrase| {
            normalized
                .strip_prefix(phrase.as_str())
                .map(|rest| (phrase, rest.trim_start_matches(is_separator)))
        })
    }

    /// Turn an utterance into a command, or `None` if no key phrase leads it.
    pub fn match_utterance(&self, utterance: &RawUtterance) -> Option<Command> {
        let normalized = normalize(&utterance.text);
        let (_, rest) = self.strip(&normalized)?;
        Some(Command {
            id: CommandId(self.next_command.fetch_add(1, Ordering::Relaxed)),
            text: rest.to_string(),
            origin: utterance.id,
            source: utterance.source.clone(),
            timestamp: Utc::now(),
        })
    }
}

fn is_separator(c: char) -> bool {
    !(c.is_alphanumeric() || c == '\'')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UtteranceId;
    use crate::plugin::InstanceId;

    fn utterance(id: u64, text: &str) -> RawUtterance {
        RawUtterance {
            id: UtteranceId(id),
            source: InstanceId::new("input/test#0"),
            text: text.into(),
            timestamp: Utc::now(),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn strips_key_phrase_and_separators() {
        let matcher = PhraseMatcher::from_phrases(&["Hey Computer"]).unwrap();
        let cmd = matcher
            .match_utterance(&utterance(3, "Hey Computer what time is it"))
            .expect("should match");
        assert_eq!(cmd.text, "what time is it");
        assert_eq!(cmd.origin, UtteranceId(3));
        assert_eq!(cmd.source.as_str(), "input/test#0");
    }

    #[test]
    fn matching_ignores_case_and_punctuation() {
        let matcher = PhraseMatcher::from_phrases(&["Hey Computer"]).unwrap();
        let cmd = matcher
            .match_utterance(&utterance(0, "HEY,  computer... Volume UP!"))
            .expect("should match");
        assert_eq!(cmd.text, "volume up");
    }

    #[test]
    fn unprefixed_utterance_is_dropped() {
        let matcher = PhraseMatcher::from_phrases(&["Hey Computer"]).unwrap();
        assert!(matcher
            .match_utterance(&utterance(0, "turn on the lights"))
            .is_none());
        assert!(matcher.match_utterance(&utterance(1, "")).is_none());
    }

    #[test]
    fn wake_phrase_alone_yields_empty_command() {
        let matcher = PhraseMatcher::from_phrases(&["Dexter"]).unwrap();
        let cmd = matcher
            .match_utterance(&utterance(0, "Dexter."))
            .expect("wake phrase alone is a command");
        assert_eq!(cmd.text, "");
    }

    #[test]
    fn first_configured_phrase_wins_on_overlap() {
        let matcher = PhraseMatcher::from_phrases(&["Hey", "Hey Computer"]).unwrap();
        let cmd = matcher
            .match_utterance(&utterance(0, "hey computer stop"))
            .unwrap();
        assert_eq!(cmd.text, "computer stop");

        let matcher = PhraseMatcher::from_phrases(&["Hey Computer", "Hey"]).unwrap();
        let cmd = matcher
            .match_utterance(&utterance(0, "hey computer stop"))
            .unwrap();
        assert_eq!(cmd.text, "stop");
    }

    #[test]
    fn command_ids_increase_per_match() {
        let matcher = PhraseMatcher::from_phrases(&["dexter"]).unwrap();
        let a = matcher.match_utterance(&utterance(0, "dexter a")).unwrap();
        assert!(matcher.match_utterance(&utterance(1, "nope")).is_none());
        let b = matcher.match_utterance(&utterance(2, "dexter b")).unwrap();
        assert_eq!(a.id, CommandId(0));
        assert_eq!(b.id, CommandId(1));
    }

    #[test]
    fn remainder_equals_normalized_text_minus_phrase() {
        let phrases = ["Hey Computer", "Dexter", "ok house"];
        let texts = [
            "hey computer",
            "Hey Computer, play some jazz",
            "dexter   what's the weather?",
            "OK House: lights off",
            "Dextering",
        ];
        let matcher = PhraseMatcher::from_phrases(&phrases).unwrap();
        for text in texts {
            let normalized = normalize(text);
            let phrase = phrases
                .iter()
                .map(|p| normalize(p))
                .find(|p| normalized.starts_with(p.as_str()))
                .expect("every sample starts with a phrase");
            let expected = normalized[phrase.len()..].trim_start().to_string();
            let cmd = matcher.match_utterance(&utterance(0, text)).unwrap();
            assert_eq!(cmd.text, expected, "text={text:?}");
        }
    }

    #[test]
    fn blank_key_phrase_is_a_configuration_error() {
        assert!(matches!(
            KeyPhrase::new(" ,, "),
            Err(VoxError::Configuration(_))
        ));
    }
}
