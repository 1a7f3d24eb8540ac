//! Contract with the external CRDT engine (§6).
//!
//! The core never implements CRDT merge semantics itself — it only needs a
//! version vector it can compare, and byte-level export/import. Concrete
//! engines (loro, automerge, yrs, ...) plug in by implementing
//! [`CrdtDocument`]; the `testing` feature ships [`crate::testing::MockDoc`]
//! for exercising the core without a production CRDT.

use thiserror::Error;

/// Four-valued comparison between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Equal,
    Greater,
    Concurrent,
}

/// What kind of byte export to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode<'a, V> {
    /// A full, self-contained encoding of the document's current state.
    Snapshot,
    /// Operations strictly after `from`. `from = None` behaves like
    /// `Snapshot` (an empty version vector has nothing to be "after").
    Update { from: Option<&'a V> },
}

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("import rejected malformed bytes: {0}")]
    Malformed(String),
}

/// A version vector: a mapping from peer identifier to operation counter.
/// Must be cheaply cloneable and have a canonical byte encoding (used both on
/// the wire, inside storage-adapter keys, and in `cmd/log` fields).
pub trait VersionVector: Clone + PartialEq + Send + Sync + 'static {
    fn compare(&self, other: &Self) -> Comparison;

    /// Canonical byte encoding, stable across processes (storage-adapter keys
    /// and message fields rely on this being deterministic for equal
    /// vectors).
    fn to_canonical_bytes(&self) -> Vec<u8>;

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, CrdtError>
    where
        Self: Sized;

    /// True for the version vector of a document nobody has written to yet.
    fn is_empty(&self) -> bool;
}

/// A document handle owned by the core. `import`/`export` must be total on
/// valid inputs; `import` must be idempotent and commutative with respect to
/// other imports (the CRDT property the whole multi-hop design leans on).
pub trait CrdtDocument: Send + Sync {
    type Version: VersionVector;

    fn version(&self) -> Self::Version;

    fn export(&self, mode: ExportMode<'_, Self::Version>) -> Vec<u8>;

    /// Applies `bytes` to the document. Implementations must reject bytes
    /// they cannot parse with [`CrdtError::Malformed`] and otherwise leave
    /// the document unchanged (§7: malformed payloads must not mutate state).
    fn import(&mut self, bytes: &[u8]) -> Result<(), CrdtError>;

    /// A rough cost estimate (in bytes) of exporting an update from `from`,
    /// used by the sync engine to decide snapshot vs. update (§4.4 rule 1).
    /// A document with no prior relationship to the peer (`from = None`)
    /// always estimates as "send a snapshot".
    fn estimated_update_size(&self, from: Option<&Self::Version>) -> usize;

    /// Registers a callback the engine invokes after every local or imported
    /// mutation, carrying the post-change version (§6). The shell uses this
    /// to re-enter the dispatcher as a `LocalChangeEvent` — the core itself
    /// never calls this method, only the shell at `cmd/subscribe-doc` time.
    fn subscribe(&mut self, callback: Box<dyn Fn(Self::Version) + Send + Sync>);
}
