use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{model::*, ProducerError};

/// One successful refresh. Appended to the ledger, never rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub timestamp_unix: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub payload: String,
}

/// The pair of derived values served to readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub summary: String,
    pub sentiment: Sentiment,
}

impl Digest {
    pub fn new(summary: impl Into<String>, sentiment: Sentiment) -> Self {
        Self { summary: summary.into(), sentiment }
    }

    pub fn artifacts(&self) -> [Artifact; 2] {
        [
            Artifact { kind: ArtifactKind::Summary, payload: self.summary.clone() },
            Artifact { kind: ArtifactKind::Sentiment, payload: self.sentiment.as_str().to_string() },
        ]
    }

    /// Rebuilds a digest from the two stored payloads.
    pub fn from_payloads(summary: String, sentiment: &str) -> Result<Self, ProducerError> {
        Ok(Self { summary, sentiment: Sentiment::parse_label(sentiment)? })
    }

    /// Rejects output the cache must never persist.
    pub fn validate(&self) -> Result<(), ProducerError> {
        if self.summary.trim().is_empty() {
            return Err(ProducerError::Malformed("empty summary".into()));
        }
        Ok(())
    }

    /// Hex SHA-256 over both payloads.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for a in self.artifacts() {
            h.update(a.kind.as_str().as_bytes());
            h.update([0u8]);
            h.update(a.payload.as_bytes());
            h.update([0u8]);
        }
        hex::encode(h.finalize())
    }
}

/// What the producer is asked to summarize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub topic: String,
    pub query: String,
    pub as_of_unix: i64,
}
