//! A minimal CRDT used to exercise [`crate::dispatcher`] without pulling in
//! a production engine (SPEC_FULL §8). Not a real CRDT in the
//! conflict-free-merge sense beyond what the test scenarios need: each
//! replica tracks, per author, how many ops it has seen (a version vector)
//! and a log of `(author, seq, payload)` triples it can export/import.
//! Concurrent inserts are ordered by `(seq, author)` when materialised to a
//! string, which is enough to make imports commutative and idempotent.

use std::collections::BTreeMap;

use crate::crdt::{Comparison, CrdtDocument, CrdtError, ExportMode, VersionVector};
use crate::ids::PeerId;

/// `{ author -> highest seq seen }`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MockVersion(pub BTreeMap<String, u64>);

impl MockVersion {
    pub fn empty() -> Self {
        Self::default()
    }

    fn seq_for(&self, author: &str) -> u64 {
        self.0.get(author).copied().unwrap_or(0)
    }
}

impl VersionVector for MockVersion {
    fn compare(&self, other: &Self) -> Comparison {
        let authors: std::collections::BTreeSet<&String> =
            self.0.keys().chain(other.0.keys()).collect();
        let mut self_ahead = false;
        let mut other_ahead = false;
        for author in authors {
            let a = self.seq_for(author);
            let b = other.seq_for(author);
            if a > b {
                self_ahead = true;
            } else if b > a {
                other_ahead = true;
            }
        }
        match (self_ahead, other_ahead) {
            (false, false) => Comparison::Equal,
            (true, false) => Comparison::Greater,
            (false, true) => Comparison::Less,
            (true, true) => Comparison::Concurrent,
        }
    }

    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.0, &mut buf).expect("MockVersion encodes");
        buf
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CrdtError> {
        ciborium::from_reader(bytes)
            .map(Self)
            .map_err(|e| CrdtError::Malformed(e.to_string()))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Op {
    author: String,
    seq: u64,
    payload: String,
}

/// An append-only text-ish log CRDT: `apply(author, text)` appends an op;
/// `materialize()` joins all ops' payloads in `(seq, author)` order.
#[derive(Default)]
pub struct MockDoc {
    author: String,
    ops: Vec<Op>,
    subscribers: Vec<Box<dyn Fn(MockVersion) + Send + Sync>>,
}

impl std::fmt::Debug for MockDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDoc").field("author", &self.author).field("ops", &self.ops).finish()
    }
}

impl MockDoc {
    pub fn new(author: impl Into<String>) -> Self {
        Self { author: author.into(), ops: Vec::new(), subscribers: Vec::new() }
    }

    fn notify(&self) {
        let version = self.version();
        for callback in &self.subscribers {
            callback(version.clone());
        }
    }

    /// Appends one local op. Returns nothing — callers read back via
    /// `materialize()` or watch `version()` to detect the change.
    pub fn insert_local(&mut self, text: impl Into<String>) {
        let seq = self
            .ops
            .iter()
            .filter(|op| op.author == self.author)
            .map(|op| op.seq)
            .max()
            .map(|s| s + 1)
            .unwrap_or(1);
        self.ops.push(Op { author: self.author.clone(), seq, payload: text.into() });
        self.notify();
    }

    pub fn materialize(&self) -> String {
        let mut sorted = self.ops.clone();
        sorted.sort_by(|a, b| (a.seq, &a.author).cmp(&(b.seq, &b.author)));
        sorted.into_iter().map(|op| op.payload).collect::<Vec<_>>().join("")
    }
}

impl CrdtDocument for MockDoc {
    type Version = MockVersion;

    fn version(&self) -> Self::Version {
        let mut map = BTreeMap::new();
        for op in &self.ops {
            let entry = map.entry(op.author.clone()).or_insert(0u64);
            if op.seq > *entry {
                *entry = op.seq;
            }
        }
        MockVersion(map)
    }

    fn export(&self, mode: ExportMode<'_, Self::Version>) -> Vec<u8> {
        let ops: Vec<&Op> = match mode {
            ExportMode::Snapshot => self.ops.iter().collect(),
            ExportMode::Update { from: None } => self.ops.iter().collect(),
            ExportMode::Update { from: Some(from) } => self
                .ops
                .iter()
                .filter(|op| op.seq > from.seq_for(&op.author))
                .collect(),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&ops, &mut buf).expect("MockDoc export encodes");
        buf
    }

    fn import(&mut self, bytes: &[u8]) -> Result<(), CrdtError> {
        let incoming: Vec<Op> =
            ciborium::from_reader(bytes).map_err(|e| CrdtError::Malformed(e.to_string()))?;
        let mut changed = false;
        for op in incoming {
            let known = self.ops.iter().any(|existing| existing.author == op.author && existing.seq == op.seq);
            if !known {
                self.ops.push(op);
                changed = true;
            }
        }
        if changed {
            self.notify();
        }
        Ok(())
    }

    fn estimated_update_size(&self, from: Option<&Self::Version>) -> usize {
        match from {
            None => usize::MAX,
            Some(from) => self
                .ops
                .iter()
                .filter(|op| op.seq > from.seq_for(&op.author))
                .map(|op| op.payload.len())
                .sum(),
        }
    }

    fn subscribe(&mut self, callback: Box<dyn Fn(Self::Version) + Send + Sync>) {
        self.subscribers.push(callback);
    }
}

pub fn mock_version() -> MockVersion {
    MockVersion::empty()
}

pub fn mock_peer_id(name: &str) -> PeerId {
    PeerId::new(name)
}
