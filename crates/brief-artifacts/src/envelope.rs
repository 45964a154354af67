use anyhow::{bail, Result};
use brief_core::ArtifactKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// On-disk form of one artifact. The checksum lets a reader refuse a payload
/// that was damaged outside the atomic-rename path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub kind: ArtifactKind,
    pub sha256: String,
    pub payload: String,
}

impl ArtifactEnvelope {
    pub fn seal(kind: ArtifactKind, payload: &str) -> Self {
        Self { kind, sha256: checksum(payload), payload: payload.to_string() }
    }

    pub fn open(self, expected: ArtifactKind) -> Result<String> {
        if self.kind != expected {
            bail!("envelope holds {} but {} was requested", self.kind, expected);
        }
        let actual = checksum(&self.payload);
        if actual != self.sha256 {
            bail!("{} checksum mismatch: recorded {}, computed {}", expected, self.sha256, actual);
        }
        Ok(self.payload)
    }
}

pub fn checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}
