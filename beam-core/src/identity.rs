//! Peer identity: session-scoped opaque names, generated at startup.

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "crisp", "dapper", "eager", "fancy", "gentle", "glad",
    "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "plucky", "proud", "quick",
    "quiet", "rapid", "shy", "silly", "sly", "snappy", "spry", "sunny", "swift", "tidy", "vivid",
    "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dingo", "eagle", "ferret", "finch", "gecko", "heron",
    "ibis", "jackal", "koala", "lemur", "lynx", "marten", "moose", "narwhal", "ocelot", "otter",
    "panda", "puffin", "quokka", "raven", "salmon", "seal", "tapir", "toucan", "walrus", "wombat",
    "yak", "zebra",
];

/// Peer identity. Compared lexicographically; the ordering decides which side of a pair dials.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Generate a fresh `adjective-animal-xxxx` identity for this session.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
        let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
        let suffix: u16 = rng.gen();
        PeerId(format!("{adjective}-{animal}-{suffix:04x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this side should dial `other` after mutual discovery.
    pub fn initiates_to(&self, other: &PeerId) -> bool {
        self < other
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_three_parts() {
        let id = PeerId::generate();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(ANIMALS.contains(&parts[1]));
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn exactly_one_side_initiates() {
        let a = PeerId::from("amber-otter-0001");
        let b = PeerId::from("brave-yak-ffff");
        assert!(a.initiates_to(&b));
        assert!(!b.initiates_to(&a));
        assert!(!a.initiates_to(&a));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = PeerId::from("calm-seal-00aa");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"calm-seal-00aa\"");
    }
}
