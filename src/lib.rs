//! Synchronization core of a peer-to-peer CRDT document repository.
//!
//! This crate is a pure update function (the protocol handlers in
//! [`establishment`], [`discovery`], [`sync_engine`], [`fanout`], threaded
//! together by [`dispatcher`]) plus an imperative shell ([`shell`]) that
//! performs every side effect the update function decides on. Callers drive
//! it through [`repo::Repo`]; transports plug in through [`adapter`].
//!
//! The crate is generic over an external CRDT engine via the [`crdt`]
//! contract — it never implements merge semantics itself, only version
//! vector comparison, channel lifecycle, peer knowledge, and the message
//! router that ties them together.

pub mod adapter;
pub mod adapters;
pub mod channel;
pub mod config;
pub mod crdt;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod establishment;
pub mod fanout;
pub mod ids;
pub mod message;
pub mod model;
pub mod peer;
pub mod permissions;
pub mod repo;
pub mod shell;
pub mod sync_engine;

/// `MockDoc`/`MockVersion`, a minimal [`crdt::CrdtDocument`] implementation
/// used by this crate's own test suite. Exposed under the `testing` feature
/// so downstream crates can exercise a [`repo::Repo`] without wiring up a
/// production CRDT engine.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{RepoConfig, RepoConfigBuilder};
pub use error::CoreError;
pub use model::Identity;
pub use repo::Repo;
