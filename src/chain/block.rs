// Chain blocks and the latest-intent view folded from them.

use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Desired {
    Active,
    Inactive,
}

impl fmt::Display for Desired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Desired::Active => "active",
            Desired::Inactive => "inactive",
        })
    }
}

/// Desired state of one service as declared by some node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub service: String,
    pub desired: Desired,
}

impl Intent {
    pub fn active(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            desired: Desired::Active,
        }
    }

    pub fn inactive(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            desired: Desired::Inactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub intents: Vec<Intent>,
    pub crc32: u32,
}

impl Block {
    pub fn new(height: u64, origin: impl Into<String>, intents: Vec<Intent>) -> Self {
        let mut block = Self {
            height,
            origin: origin.into(),
            timestamp: Utc::now(),
            intents,
            crc32: 0,
        };
        block.crc32 = block.checksum();
        block
    }

    /// CRC32 over every field except the checksum itself.
    pub fn checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.height.to_le_bytes());
        hasher.update(self.origin.as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.timestamp.timestamp_micros().to_le_bytes());
        for intent in &self.intents {
            hasher.update(intent.service.as_bytes());
            hasher.update(&[0, intent.desired as u8]);
        }
        hasher.finalize()
    }

    pub fn verify(&self) -> bool {
        self.crc32 == self.checksum()
    }
}

/// Collapses pending intents so only the last one per service survives,
/// keeping first-seen order.
pub fn dedup_intents(intents: Vec<Intent>) -> Vec<Intent> {
    let mut out: Vec<Intent> = Vec::with_capacity(intents.len());
    for intent in intents {
        match out.iter_mut().find(|i| i.service == intent.service) {
            Some(existing) => existing.desired = intent.desired,
            None => out.push(intent),
        }
    }
    out
}

/// Latest intent per service across all folded blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntentView {
    height: u64,
    latest: BTreeMap<String, (Desired, u64)>,
}

impl IntentView {
    /// Folds one block. Blocks at or below the current height are ignored.
    pub fn apply(&mut self, block: &Block) {
        if block.height <= self.height {
            return;
        }
        for intent in &block.intents {
            self.latest
                .insert(intent.service.clone(), (intent.desired, block.height));
        }
        self.height = block.height;
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Latest desired state of `service` and the height it was declared at.
    pub fn get(&self, service: &str) -> Option<(Desired, u64)> {
        self.latest.get(service).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Desired, u64)> {
        self.latest.iter().map(|(s, (d, h))| (s.as_str(), *d, *h))
    }

    pub fn clear(&mut self) {
        self.height = 0;
        self.latest.clear();
    }
}
