//! Response-language selection.
//!
//! Detection is deliberately conservative: greetings, confirmations and
//! numbers never move a conversation to another language. Only an explicit
//! request ("speak english") or a message that scores clearly for one
//! supported profile does.

use crate::model::LanguageCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stop-word profile for one supported language.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
pub struct LanguageProfile {
    pub code: LanguageCode,
    /// Frequent function words; each occurrence counts as one hit.
    pub markers: Vec<String>,
    /// Characters that only occur in this language (e.g. `ß`); each counts as one hit.
    #[serde(default)]
    pub characters: Vec<char>,
    /// Phrases that request this language outright.
    #[serde(default)]
    pub switch_phrases: Vec<String>,
}

impl LanguageProfile {
    fn new(code: &str, markers: &[&str], characters: &[char], switch_phrases: &[&str]) -> Self {
        Self {
            code: LanguageCode::new(code),
            markers: markers.iter().map(|m| m.to_string()).collect(),
            characters: characters.to_vec(),
            switch_phrases: switch_phrases.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn german() -> Self {
        Self::new(
            "de",
            &[
                "ich", "du", "sie", "wir", "ihr", "der", "die", "das", "den", "dem", "und",
                "oder", "nicht", "ist", "sind", "bin", "bist", "habe", "hast", "haben", "wie",
                "was", "wann", "wo", "warum", "kann", "kannst", "können", "möchte", "mir",
                "mich", "dir", "dich", "ein", "eine", "einen", "mit", "für", "bei", "auf",
                "auch", "noch", "bitte", "danke", "gibt", "es", "euch", "termin", "viel",
                "kostet", "preis", "heute", "morgen", "zu", "von", "ja", "nein",
            ],
            &['ä', 'ö', 'ü', 'ß'],
            &["sprich deutsch", "auf deutsch", "deutsch bitte", "speak german"],
        )
    }

    pub fn english() -> Self {
        Self::new(
            "en",
            &[
                "i", "you", "we", "the", "a", "an", "and", "or", "not", "is", "are", "am",
                "have", "has", "do", "does", "how", "what", "when", "where", "why", "can",
                "could", "would", "like", "me", "my", "your", "with", "for", "at", "on",
                "also", "please", "thanks", "there", "it", "much", "cost", "costs", "price",
                "appointment", "today", "tomorrow", "to", "of", "yes", "no", "book", "this",
                "that", "want",
            ],
            &[],
            &["speak english", "in english", "english please", "switch to english"],
        )
    }
}

/// Supported languages and the thresholds that gate a switch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(schemars::JsonSchema))]
#[serde(default)]
pub struct LanguageConfig {
    pub profiles: Vec<LanguageProfile>,
    /// Messages shorter than this (in characters, trimmed) never switch.
    pub min_chars: usize,
    pub min_words: usize,
    /// Minimum marker hits for the winning profile.
    pub min_hits: usize,
    /// Minimum share of all hits the winning profile must hold.
    pub min_confidence: f32,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            profiles: vec![LanguageProfile::german(), LanguageProfile::english()],
            min_chars: 6,
            min_words: 2,
            min_hits: 2,
            min_confidence: 0.7,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionReason {
    /// No session language yet; the tenant default applies.
    TenantDefault,
    /// Input too short, ambiguous or already in the current language.
    Retained,
    /// Input scored confidently for another supported language.
    Detected,
    /// The user asked for the language explicitly.
    ExplicitRequest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageDecision {
    pub language: LanguageCode,
    pub reason: DecisionReason,
}

impl LanguageDecision {
    /// Whether the decision differs from the language the session had.
    pub fn switched_from(&self, current: Option<&LanguageCode>) -> bool {
        current.is_some_and(|current| current != &self.language)
    }
}

struct CompiledProfile {
    code: LanguageCode,
    markers: HashSet<String>,
    characters: Vec<char>,
    switch_phrases: Vec<String>,
}

pub struct LanguageDetector {
    profiles: Vec<CompiledProfile>,
    config: LanguageConfig,
}

impl LanguageDetector {
    pub fn new(config: LanguageConfig) -> Self {
        let profiles = config
            .profiles
            .iter()
            .map(|profile| CompiledProfile {
                code: profile.code.clone(),
                markers: profile.markers.iter().map(|m| m.to_lowercase()).collect(),
                characters: profile.characters.clone(),
                switch_phrases: profile
                    .switch_phrases
                    .iter()
                    .map(|p| p.to_lowercase())
                    .collect(),
            })
            .collect();
        Self { profiles, config }
    }

    pub fn supports(&self, language: &LanguageCode) -> bool {
        self.profiles.iter().any(|profile| &profile.code == language)
    }

    /// Chooses the response language for `message`.
    ///
    /// `current` is the session's language; `fallback` is the tenant default
    /// used when the session has none yet.
    pub fn detect(
        &self,
        message: &str,
        current: Option<&LanguageCode>,
        fallback: &LanguageCode,
    ) -> LanguageDecision {
        let keep = || match current {
            Some(language) => LanguageDecision {
                language: language.clone(),
                reason: DecisionReason::Retained,
            },
            None => LanguageDecision {
                language: fallback.clone(),
                reason: DecisionReason::TenantDefault,
            },
        };

        let lowered = message.to_lowercase();
        if let Some(requested) = self.explicit_request(&lowered) {
            return LanguageDecision {
                language: requested,
                reason: DecisionReason::ExplicitRequest,
            };
        }

        let words = tokenize(&lowered);
        let trimmed_chars = message.trim().chars().count();
        if trimmed_chars < self.config.min_chars || words.len() < self.config.min_words {
            return keep();
        }

        match self.score(&lowered, &words) {
            Some(detected) if Some(&detected) == current => keep(),
            Some(detected) => LanguageDecision {
                language: detected,
                reason: DecisionReason::Detected,
            },
            None => keep(),
        }
    }

    fn explicit_request(&self, lowered: &str) -> Option<LanguageCode> {
        self.profiles
            .iter()
            .find(|profile| {
                profile
                    .switch_phrases
                    .iter()
                    .any(|phrase| lowered.contains(phrase.as_str()))
            })
            .map(|profile| profile.code.clone())
    }

    fn score(&self, lowered: &str, words: &[&str]) -> Option<LanguageCode> {
        let hits: Vec<(usize, &CompiledProfile)> = self
            .profiles
            .iter()
            .map(|profile| {
                let word_hits = words
                    .iter()
                    .filter(|word| profile.markers.contains(**word))
                    .count();
                let char_hits = lowered
                    .chars()
                    .filter(|ch| profile.characters.contains(ch))
                    .count();
                (word_hits + char_hits, profile)
            })
            .collect();

        let total: usize = hits.iter().map(|(count, _)| *count).sum();
        let (best, profile) = hits.into_iter().max_by_key(|(count, _)| *count)?;
        if best < self.config.min_hits || total == 0 {
            return None;
        }
        let confidence = best as f32 / total as f32;
        if confidence < self.config.min_confidence {
            return None;
        }
        Some(profile.code.clone())
    }
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new(LanguageConfig::default())
    }
}

/// Splits on anything that is not a letter, keeping umlauts; drops pure numbers.
fn tokenize(lowered: &str) -> Vec<&str> {
    lowered
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '\''))
        .filter(|word| !word.is_empty())
        .filter(|word| word.chars().any(char::is_alphabetic))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn de() -> LanguageCode {
        LanguageCode::new("de")
    }

    fn en() -> LanguageCode {
        LanguageCode::new("en")
    }

    #[test]
    fn numbers_do_not_count_as_words() {
        assert_eq!(tokenize("13 uhr, 2024"), vec!["uhr"]);
        assert_eq!(tokenize("what's up?"), vec!["what's", "up"]);
    }

    #[test]
    fn greeting_without_session_language_uses_default() {
        let detector = LanguageDetector::default();
        let decision = detector.detect("Hallo", None, &de());
        assert_eq!(decision.language, de());
        assert_eq!(decision.reason, DecisionReason::TenantDefault);
    }

    #[test]
    fn unambiguous_english_first_message_wins_over_default() {
        let detector = LanguageDetector::default();
        let decision = detector.detect("How much does a leg wax cost?", None, &de());
        assert_eq!(decision.language, en());
        assert_eq!(decision.reason, DecisionReason::Detected);
    }

    #[test]
    fn mixed_input_below_confidence_is_retained() {
        let detector = LanguageDetector::default();
        let decision = detector.detect("ich want termin please und the", Some(&de()), &de());
        assert_eq!(decision.language, de());
        assert_eq!(decision.reason, DecisionReason::Retained);
    }

    #[test]
    fn explicit_request_ignores_length_threshold() {
        let detector = LanguageDetector::default();
        let decision = detector.detect("Speak English", Some(&de()), &de());
        assert_eq!(decision.language, en());
        assert_eq!(decision.reason, DecisionReason::ExplicitRequest);
        assert!(decision.switched_from(Some(&de())));
    }
}
