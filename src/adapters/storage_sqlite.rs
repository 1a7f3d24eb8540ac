//! SQLite-backed storage adapter (§6, SPEC_FULL §6a).
//!
//! Presents to the core as an ordinary peer with a synthetic, stable
//! `peerId` of the form `storage-<adapter-id>` (§6) — the core's own
//! establishment/discovery/sync handlers run unmodified against it, the
//! same way they would against a real remote. What makes this a *storage*
//! adapter rather than another in-memory peer is that it answers every
//! protocol message out of SQLite instead of an in-memory `Model`, the way
//! the teacher persists its read model in `db.rs` behind a `SqlitePool`
//! (`run_migrations`, `sqlx::query(...).execute(pool)`).
//!
//! Two key tables, mirroring the hierarchical `[docId]` / `[docId, "update",
//! versionEncoding]` key schema described in §6:
//! - `doc_snapshots(doc_id PRIMARY KEY, data)` — the most recent full export.
//! - `doc_updates(doc_id, version_bytes, seq, data)`, `PRIMARY KEY (doc_id,
//!   version_bytes)` — increments recorded since the last snapshot,
//!   deduplicated by the version they were exported from and ordered by a
//!   monotonic `seq` for deterministic replay.
//!
//! Compaction is on-threshold (SPEC_FULL §9 Open Question resolution):
//! once a document accumulates `compact_after_n_updates` rows, the worker
//! reconstructs it, exports a fresh snapshot, and clears the updates table
//! for that document.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::adapter::{Adapter, ChannelEvent, GeneratedChannel};
use crate::channel::ChannelKind;
use crate::crdt::{Comparison, CrdtDocument, ExportMode, VersionVector};
use crate::ids::{DocumentId, PeerId};
use crate::message::{SyncRequestEntry, Transmission, WireMessage};
use crate::peer::PeerIdentity;

/// Above this estimated byte count the worker sends a fresh snapshot rather
/// than a scoped update — the same threshold `sync_engine` applies for a
/// live in-memory peer (§4.4 rule 1).
const SNAPSHOT_BYTE_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored CRDT bytes were malformed: {0}")]
    Malformed(#[from] crate::crdt::CrdtError),
}

/// Creates the two tables above if they do not already exist. Safe to call
/// on every connect — `CREATE TABLE IF NOT EXISTS`, the same idiom the
/// teacher's own `db::run_migrations` uses.
async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS doc_snapshots (
            doc_id  TEXT PRIMARY KEY,
            data    BLOB NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS doc_updates (
            doc_id          TEXT NOT NULL,
            version_bytes   BLOB NOT NULL,
            seq             INTEGER NOT NULL,
            data            BLOB NOT NULL,
            PRIMARY KEY (doc_id, version_bytes)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn list_doc_ids(pool: &SqlitePool) -> Result<Vec<DocumentId>, StorageError> {
    let rows = sqlx::query(
        "SELECT doc_id FROM doc_snapshots \
         UNION \
         SELECT doc_id FROM doc_updates",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| DocumentId::new(row.get::<String, _>("doc_id"))).collect())
}

/// Rebuilds a document from its last snapshot (if any) plus every update
/// recorded since, in `seq` order. `None` means storage has never heard of
/// this `doc_id`.
async fn reconstruct<D: CrdtDocument + Default>(
    pool: &SqlitePool,
    doc_id: &DocumentId,
) -> Result<Option<D>, StorageError> {
    let snapshot_row = sqlx::query("SELECT data FROM doc_snapshots WHERE doc_id = ?")
        .bind(doc_id.as_str())
        .fetch_optional(pool)
        .await?;

    let update_rows = sqlx::query("SELECT data FROM doc_updates WHERE doc_id = ? ORDER BY seq ASC")
        .bind(doc_id.as_str())
        .fetch_all(pool)
        .await?;

    if snapshot_row.is_none() && update_rows.is_empty() {
        return Ok(None);
    }

    let mut doc = D::default();
    if let Some(row) = snapshot_row {
        doc.import(&row.get::<Vec<u8>, _>("data"))?;
    }
    for row in update_rows {
        doc.import(&row.get::<Vec<u8>, _>("data"))?;
    }
    Ok(Some(doc))
}

async fn persist_snapshot(pool: &SqlitePool, doc_id: &DocumentId, data: Vec<u8>) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO doc_snapshots (doc_id, data) VALUES (?, ?) \
         ON CONFLICT(doc_id) DO UPDATE SET data = excluded.data",
    )
    .bind(doc_id.as_str())
    .bind(data)
    .execute(pool)
    .await?;
    sqlx::query("DELETE FROM doc_updates WHERE doc_id = ?")
        .bind(doc_id.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

async fn persist_update(
    pool: &SqlitePool,
    doc_id: &DocumentId,
    version_bytes: Vec<u8>,
    seq: u64,
    data: Vec<u8>,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO doc_updates (doc_id, version_bytes, seq, data) VALUES (?, ?, ?, ?) \
         ON CONFLICT(doc_id, version_bytes) DO UPDATE SET data = excluded.data, seq = excluded.seq",
    )
    .bind(doc_id.as_str())
    .bind(version_bytes)
    .bind(seq as i64)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

async fn update_count(pool: &SqlitePool, doc_id: &DocumentId) -> Result<u32, StorageError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM doc_updates WHERE doc_id = ?")
        .bind(doc_id.as_str())
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("n") as u32)
}

async fn delete_doc(pool: &SqlitePool, doc_id: &DocumentId) -> Result<bool, StorageError> {
    let a = sqlx::query("DELETE FROM doc_snapshots WHERE doc_id = ?")
        .bind(doc_id.as_str())
        .execute(pool)
        .await?;
    let b = sqlx::query("DELETE FROM doc_updates WHERE doc_id = ?")
        .bind(doc_id.as_str())
        .execute(pool)
        .await?;
    Ok(a.rows_affected() > 0 || b.rows_affected() > 0)
}

/// One side of the storage adapter's internal protocol handling, run as a
/// background task the lifetime of the adapter. Everything here is the
/// storage-specific analogue of `establishment`/`discovery`/`sync_engine` —
/// it answers the same wire messages, just against SQLite instead of
/// `model.documents`.
struct Worker<D: CrdtDocument> {
    pool: SqlitePool,
    identity: PeerIdentity,
    compact_after_n_updates: u32,
    seq: AtomicU64,
    inbound: mpsc::UnboundedReceiver<WireMessage<D::Version>>,
    outbound: mpsc::UnboundedSender<WireMessage<D::Version>>,
    _marker: PhantomData<D>,
}

impl<D: CrdtDocument + Default> Worker<D>
where
    D::Version: Default,
{
    async fn run(mut self) {
        while let Some(message) = self.inbound.recv().await {
            if let Err(e) = self.handle(message).await {
                log::error!("storage adapter error: adapter_id={} error={e}", self.identity.peer_id);
            }
        }
    }

    async fn handle(&mut self, message: WireMessage<D::Version>) -> Result<(), StorageError> {
        match message {
            WireMessage::EstablishRequest { identity: _ } => {
                let _ = self.outbound.send(WireMessage::EstablishResponse { identity: self.identity.clone() });
                // Storage runs the new-peer path from its own side too
                // (§4.2 permits concurrent initiation by both parties) so it
                // learns what the other side holds and, per §9, ends up
                // subscribed to documents it does not yet have.
                let _ = self.outbound.send(WireMessage::DirectoryRequest);
            }
            WireMessage::DirectoryRequest => {
                let doc_ids = list_doc_ids(&self.pool).await?;
                let _ = self.outbound.send(WireMessage::DirectoryResponse { doc_ids });
            }
            WireMessage::DirectoryResponse { doc_ids } => {
                // Ask for anything announced that storage hasn't recorded
                // yet — this is what causes the responder (the live repo)
                // to register storage's subscription for that document.
                for doc_id in doc_ids {
                    if reconstruct::<D>(&self.pool, &doc_id).await?.is_none() {
                        let _ = self.outbound.send(WireMessage::SyncRequest {
                            docs: vec![SyncRequestEntry { doc_id, requester_version: D::Version::default() }],
                        });
                    }
                }
            }
            WireMessage::SyncRequest { docs } => {
                for entry in docs {
                    let (doc_id, transmission) = self.answer_sync_request(entry).await?;
                    let _ = self.outbound.send(WireMessage::SyncResponse { doc_id, transmission });
                }
            }
            WireMessage::SyncResponse { doc_id, transmission } => {
                self.persist_transmission(doc_id, transmission).await?;
            }
            WireMessage::DeleteRequest { doc_id } => {
                let deleted = delete_doc(&self.pool, &doc_id).await?;
                let _ = self.outbound.send(WireMessage::DeleteResponse { doc_id, deleted });
            }
            WireMessage::EstablishResponse { .. } | WireMessage::DeleteResponse { .. } => {
                // Storage never initiates establishment or deletion itself,
                // so replies to those never arrive; nothing to do.
            }
        }
        Ok(())
    }

    async fn answer_sync_request(
        &self,
        entry: SyncRequestEntry<D::Version>,
    ) -> Result<(DocumentId, Transmission<D::Version>), StorageError> {
        let doc_id = entry.doc_id;
        let Some(doc) = reconstruct::<D>(&self.pool, &doc_id).await? else {
            return Ok((doc_id, Transmission::Unavailable));
        };
        let local_version = doc.version();
        let comparison = local_version.compare(&entry.requester_version);
        let transmission = match comparison {
            Comparison::Equal => Transmission::UpToDate { version: local_version },
            Comparison::Greater | Comparison::Concurrent => {
                let from = if entry.requester_version.is_empty() { None } else { Some(&entry.requester_version) };
                let estimate = doc.estimated_update_size(from);
                if estimate == usize::MAX || estimate > SNAPSHOT_BYTE_THRESHOLD {
                    Transmission::Snapshot { data: doc.export(ExportMode::Snapshot), version: local_version }
                } else {
                    Transmission::Update { data: doc.export(ExportMode::Update { from }), version: local_version }
                }
            }
            Comparison::Less => {
                Transmission::Update {
                    data: doc.export(ExportMode::Update { from: Some(&entry.requester_version) }),
                    version: local_version,
                }
            }
        };
        Ok((doc_id, transmission))
    }

    async fn persist_transmission(
        &self,
        doc_id: DocumentId,
        transmission: Transmission<D::Version>,
    ) -> Result<(), StorageError> {
        match transmission {
            Transmission::Snapshot { data, .. } => {
                persist_snapshot(&self.pool, &doc_id, data).await?;
            }
            Transmission::Update { data, version } => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                persist_update(&self.pool, &doc_id, version.to_canonical_bytes(), seq, data).await?;
                if update_count(&self.pool, &doc_id).await? >= self.compact_after_n_updates {
                    if let Some(doc) = reconstruct::<D>(&self.pool, &doc_id).await? {
                        persist_snapshot(&self.pool, &doc_id, doc.export(ExportMode::Snapshot)).await?;
                    }
                }
            }
            Transmission::UpToDate { .. } | Transmission::Unavailable => {}
        }
        Ok(())
    }
}

/// The adapter handle itself: constructs the SQLite pool, wires the
/// cross-connected channel pair, and spawns [`Worker::run`] on `start()`.
pub struct SqliteStorageAdapter<D: CrdtDocument> {
    adapter_id: String,
    pool: SqlitePool,
    compact_after_n_updates: u32,
    generated: Option<GeneratedChannel<D::Version>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent<D::Version>>,
    events_rx: Option<mpsc::UnboundedReceiver<ChannelEvent<D::Version>>>,
    worker_inbound: Option<mpsc::UnboundedReceiver<WireMessage<D::Version>>>,
    worker_outbound: mpsc::UnboundedSender<WireMessage<D::Version>>,
}

impl<D: CrdtDocument + Default + 'static> SqliteStorageAdapter<D> {
    /// Opens (creating if absent) the SQLite database at `database_url`
    /// (e.g. `sqlite://./repo.db?mode=rwc` or `sqlite::memory:` for tests)
    /// and runs the adapter's own migrations.
    pub async fn connect(
        adapter_id: impl Into<String>,
        database_url: &str,
        compact_after_n_updates: u32,
    ) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect(database_url).await?;
        run_migrations(&pool).await?;

        let adapter_id = adapter_id.into();
        let (shell_outbound_tx, worker_inbound) = mpsc::unbounded_channel::<WireMessage<D::Version>>();
        let (worker_outbound, shell_inbound_rx) = mpsc::unbounded_channel::<WireMessage<D::Version>>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let generated = GeneratedChannel {
            adapter_id: adapter_id.clone(),
            kind: ChannelKind::Storage,
            outbound: shell_outbound_tx,
            inbound: shell_inbound_rx,
        };

        Ok(Self {
            adapter_id,
            pool,
            compact_after_n_updates,
            generated: Some(generated),
            events_tx,
            events_rx: Some(events_rx),
            worker_inbound: Some(worker_inbound),
            worker_outbound,
        })
    }
}

impl<D: CrdtDocument + Default + 'static> Adapter<D::Version> for SqliteStorageAdapter<D>
where
    D::Version: Default,
{
    fn events(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent<D::Version>> {
        self.events_rx.take().expect("events() is only called once per adapter")
    }

    fn start(&mut self) {
        let Some(generated) = self.generated.take() else { return };
        let Some(worker_inbound) = self.worker_inbound.take() else { return };

        let worker = Worker::<D> {
            pool: self.pool.clone(),
            identity: PeerIdentity { peer_id: PeerId::for_storage_adapter(&self.adapter_id), name: self.adapter_id.clone() },
            compact_after_n_updates: self.compact_after_n_updates,
            seq: AtomicU64::new(0),
            inbound: worker_inbound,
            outbound: self.worker_outbound.clone(),
            _marker: PhantomData,
        };
        tokio::spawn(worker.run());

        let _ = self.events_tx.send(ChannelEvent::Generated(generated));
    }

    fn deinit(&mut self) {
        let _ = self.events_tx.send(ChannelEvent::Removed { adapter_id: self.adapter_id.clone() });
    }
}
