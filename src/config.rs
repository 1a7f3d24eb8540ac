//! Repository configuration (SPEC_FULL §1a). Passed explicitly into the
//! constructor rather than read from a file — the core owns no persistent
//! store and no wire framing, so there is nothing file-based to configure.

use std::time::Duration;

/// Tunables for one [`crate::repo::Repo`] instance.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// How long a peer with zero bound channels may sit idle before it is
    /// garbage-collected from `model.peers` (§3, SPEC_FULL §4.1a). `None`
    /// disables GC entirely.
    pub peer_idle_gc: Option<Duration>,

    /// Default deadline for a correlated request (`ensure_document`,
    /// `delete_document`) before it is rejected with `Timeout` (§5, §7).
    pub request_timeout: Duration,

    /// How many updates the storage adapter persists for a document before
    /// compacting them into a fresh snapshot (SPEC_FULL §9 — on-threshold
    /// compaction was the open question's resolution).
    pub compact_after_n_updates: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            peer_idle_gc: Some(Duration::from_secs(60 * 60)),
            request_timeout: Duration::from_secs(30),
            compact_after_n_updates: 32,
        }
    }
}

impl RepoConfig {
    pub fn builder() -> RepoConfigBuilder {
        RepoConfigBuilder(Self::default())
    }
}

/// Builder mirroring the shape of the teacher's explicit-parameter
/// constructors (`store::bootstrap`, `network::init_network`) rather than a
/// file-based config layer.
#[derive(Debug, Clone)]
pub struct RepoConfigBuilder(RepoConfig);

impl RepoConfigBuilder {
    pub fn peer_idle_gc(mut self, d: Option<Duration>) -> Self {
        self.0.peer_idle_gc = d;
        self
    }

    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.0.request_timeout = d;
        self
    }

    pub fn compact_after_n_updates(mut self, n: u32) -> Self {
        self.0.compact_after_n_updates = n;
        self
    }

    pub fn build(self) -> RepoConfig {
        self.0
    }
}
