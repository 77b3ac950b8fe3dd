//! Human-memorable code phrases and the relay fingerprint derived from them.
//!
//! A phrase looks like `amber-falcon-river-42`: a few dictionary words and a
//! two digit suffix. Both users type the same phrase; the relay only ever sees
//! the [`Fingerprint`], which is computed from the first word and the suffix.
//! The remaining words stay local and feed the PAKE.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_WORD_COUNT: usize = 3;
pub const FALLBACK_TOKEN_LEN: usize = 12;

const FINGERPRINT_LABEL: &[u8] = b"ferry/room/v1";
const TOKEN_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";

const WORDS: &[&str] = &[
    "acid", "amber", "anchor", "apple", "arrow", "atlas", "autumn", "badge", "bamboo", "banjo",
    "basil", "beacon", "birch", "bison", "blade", "blossom", "bottle", "breeze", "brick", "bronze",
    "cactus", "camel", "canyon", "carbon", "castle", "cedar", "cherry", "cobalt", "comet", "copper",
    "coral", "cosmic", "crane", "crystal", "dagger", "delta", "denim", "desert", "dragon", "drum",
    "eagle", "echo", "ember", "emerald", "falcon", "fern", "fiddle", "flint", "forest", "fossil",
    "galaxy", "garnet", "ginger", "glacier", "granite", "gravel", "harbor", "hazel", "helium", "hollow",
    "honey", "horizon", "indigo", "iris", "ivory", "jade", "jasmine", "jigsaw", "juniper", "kayak",
    "kernel", "kettle", "lagoon", "lantern", "lemon", "lilac", "lotus", "magnet", "maple", "marble",
    "meadow", "meteor", "mint", "mosaic", "nectar", "nickel", "nimbus", "oasis", "ocean", "olive",
    "onyx", "orbit", "orchid", "otter", "paddle", "panda", "pebble", "pepper", "pilot", "pine",
    "planet", "plum", "prism", "quartz", "quill", "radar", "raven", "reef", "ribbon", "river",
    "rocket", "saddle", "saffron", "salmon", "sapphire", "shadow", "silver", "socket", "sparrow", "spruce",
    "summit", "tango", "thistle", "thunder", "timber", "topaz", "tulip", "tundra", "velvet", "violet",
    "walnut", "willow", "winter", "zephyr",
];

/// Produces code phrases from a word list.
#[derive(Debug, Clone)]
pub struct CodePhraseGenerator<'a> {
    words: &'a [&'a str],
    word_count: usize,
}

impl Default for CodePhraseGenerator<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl CodePhraseGenerator<'static> {
    pub fn new() -> Self {
        Self {
            words: WORDS,
            word_count: DEFAULT_WORD_COUNT,
        }
    }
}

impl<'a> CodePhraseGenerator<'a> {
    pub fn with_dictionary(words: &'a [&'a str]) -> Self {
        Self {
            words,
            word_count: DEFAULT_WORD_COUNT,
        }
    }

    pub fn word_count(mut self, word_count: usize) -> Self {
        self.word_count = word_count.max(1);
        self
    }

    /// Returns `word-word-word-NN`, or a random token when the dictionary is empty.
    pub fn generate(&self) -> String {
        let mut rng = rand::rng();

        if self.words.is_empty() {
            return random_token(&mut rng, FALLBACK_TOKEN_LEN);
        }

        let mut parts: Vec<String> = (0..self.word_count)
            .map(|_| self.words[rng.random_range(0..self.words.len())].to_string())
            .collect();
        let suffix: u8 = rng.random_range(0..100);
        parts.push(format!("{:02}", suffix));
        parts.join("-")
    }
}

fn random_token<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Generate a phrase with the built-in dictionary.
pub fn generate_code_phrase() -> String {
    CodePhraseGenerator::new().generate()
}

/// Canonical form of a typed phrase: trimmed, lowercase, whitespace runs become `-`.
pub fn normalize(phrase: &str) -> String {
    phrase
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Non-secret identifier both parties present to the relay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_phrase(phrase: &str) -> Self {
        let normalized = normalize(phrase);
        let parts: Vec<&str> = normalized.split('-').collect();
        let material = if parts.len() >= 2 {
            format!("{}-{}", parts[0], parts[parts.len() - 1])
        } else {
            normalized.clone()
        };

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_LABEL);
        hasher.update(material.as_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}
