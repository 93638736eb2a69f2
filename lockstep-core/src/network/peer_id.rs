//! Peer Identifier Generation and Parsing
//!
//! Every peer gets a short random identifier. The data and video channels are
//! registered with the signaling collaborator under names derived from it.

use std::fmt;

/// Characters used in peer identifiers (lowercase hex)
const ALPHABET: &[u8] = b"0123456789abcdef";

/// Identifier length (16 hex chars = 64 bits)
const ID_LENGTH: usize = 16;

/// A peer identifier shared out of band so the other side can connect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a random identifier
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut id = String::with_capacity(ID_LENGTH);
        for _ in 0..ID_LENGTH {
            let idx = rng.gen_range(0..ALPHABET.len());
            id.push(ALPHABET[idx] as char);
        }
        PeerId(id)
    }

    /// Parse an identifier from user input
    ///
    /// Trims surrounding whitespace, lowercases and validates the format.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_lowercase();

        if normalized.len() != ID_LENGTH {
            return None;
        }

        if normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Some(PeerId(normalized))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Endpoint name of the data (sync message) channel
    pub fn data_endpoint(&self) -> String {
        format!("{}-data", self.0)
    }

    /// Endpoint name of the video channel
    pub fn video_endpoint(&self) -> String {
        format!("{}-video", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
