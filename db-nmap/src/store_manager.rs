use std::path::{Path, PathBuf};
use std::thread;
use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use shared::types::ScanRecord;
use crate::scan::decoder::{self, DecodeError, DecodeSummary, HostHandler};
use crate::store::db::ScanDb;
use crate::store::merge::MergePolicy;
use crate::store::supervisor::{Connect, ConnectionSupervisor, SupervisorError};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The host could not be written; the store itself is still usable.
    #[error(transparent)]
    Upsert(anyhow::Error),

    #[error("store unavailable")]
    Unavailable(#[from] SupervisorError),

    #[error("store thread has shut down")]
    Closed,
}

/// Commands sent to the store thread
pub enum StoreCommand {
    Upsert {
        workspace_id: i64,
        record: ScanRecord,
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    Workspace(String, oneshot::Sender<Result<i64>>),
    HostCount(i64, oneshot::Sender<Result<i64>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Handle to the thread that owns the database connection
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread.
    ///
    /// With a supervisor, the connection is checked before every command and
    /// replaced when it has gone away.
    pub fn spawn<C>(db: ScanDb, supervisor: Option<ConnectionSupervisor<C>>, policy: MergePolicy) -> Self
    where
        C: Connect<Handle = ScanDb> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            let mut db = Some(db);

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Upsert { workspace_id, record, reply } => {
                        let result = live(&mut db, supervisor.as_ref()).and_then(|db| {
                            db.upsert_host(workspace_id, &record, policy)
                                .map_err(StoreError::Upsert)
                        });
                        let _ = reply.send(result);
                    }
                    StoreCommand::Workspace(name, reply) => {
                        let result = live(&mut db, supervisor.as_ref())
                            .map_err(anyhow::Error::from)
                            .and_then(|db| db.workspace_id(&name));
                        let _ = reply.send(result);
                    }
                    StoreCommand::HostCount(workspace_id, reply) => {
                        let result = live(&mut db, supervisor.as_ref())
                            .map_err(anyhow::Error::from)
                            .and_then(|db| db.host_count(workspace_id));
                        let _ = reply.send(result);
                    }
                    StoreCommand::Shutdown(reply) => {
                        tracing::debug!("Store thread shutting down");
                        let result = db.take().map_or(Ok(()), ScanDb::close);
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Reconcile one host. Returns the number of services written.
    pub async fn upsert(&self, workspace_id: i64, record: ScanRecord) -> Result<usize, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Upsert { workspace_id, record, reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Resolve a workspace name to its id, creating it if needed
    pub async fn workspace_id(&self, name: &str) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Workspace(name.to_string(), reply)).await?;
        rx.await?
    }

    pub async fn host_count(&self, workspace_id: i64) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::HostCount(workspace_id, reply)).await?;
        rx.await?
    }

    /// Close the database and stop the store thread
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Shutdown(reply)).await?;
        rx.await?
    }
}

fn live<'a, C: Connect<Handle = ScanDb>>(
    db: &'a mut Option<ScanDb>,
    supervisor: Option<&ConnectionSupervisor<C>>,
) -> Result<&'a mut ScanDb, StoreError> {
    let Some(supervisor) = supervisor else {
        return db.as_mut().ok_or(StoreError::Closed);
    };

    let handle = match db.take() {
        Some(handle) => supervisor.ensure_live(handle)?,
        None => supervisor.reconnect()?,
    };
    Ok(db.insert(handle))
}

/// Running totals for one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestTotals {
    /// Hosts with at least one service written
    pub hosts: usize,
    pub services: usize,
    pub failed: usize,
}

/// Feeds decoded hosts into the store and keeps the totals.
pub struct Ingest {
    store: StoreHandle,
    workspace_id: i64,
    totals: IngestTotals,
}

impl Ingest {
    pub fn new(store: StoreHandle, workspace_id: i64) -> Self {
        Self {
            store,
            workspace_id,
            totals: IngestTotals::default(),
        }
    }

    pub fn totals(&self) -> IngestTotals {
        self.totals
    }
}

impl HostHandler for Ingest {
    async fn on_host(&mut self, record: ScanRecord) -> Result<()> {
        let host = record.to_string();

        match self.store.upsert(self.workspace_id, record).await {
            Ok(0) => {}
            Ok(services) => {
                tracing::debug!(host = %host, services, "Registered host");
                self.totals.hosts += 1;
                self.totals.services += services;
            }
            Err(StoreError::Upsert(e)) => {
                tracing::warn!(host = %host, "Failed to register host: {e:#}");
                self.totals.failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Replay a report file from disk into the store.
#[tracing::instrument(name = "import", skip_all, fields(path = %path.display()))]
pub async fn import_file(path: &Path, ingest: &mut Ingest) -> Result<DecodeSummary> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let summary = decoder::decode(tokio::io::BufReader::new(file), ingest)
        .await
        .with_context(|| format!("Failed to import {}", path.display()))?;

    if !summary.finished {
        tracing::warn!("Report ended before the closing run element, it may be incomplete");
    }
    Ok(summary)
}

/// Result of replaying a batch of report files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub totals: IngestTotals,
    /// Files that could not be opened or decoded.
    pub failed: Vec<PathBuf>,
    /// The store became unusable and the remaining files were skipped.
    pub aborted: bool,
}

impl ImportOutcome {
    pub fn exit_code(&self) -> u8 {
        if self.aborted || !self.failed.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Replay `files` in order. A file that fails is logged and skipped; a lost
/// store stops the batch.
pub async fn import_files<P: AsRef<Path>>(files: &[P], ingest: &mut Ingest) -> ImportOutcome {
    let mut failed = Vec::new();

    for file in files {
        let path = file.as_ref();
        match import_file(path, ingest).await {
            Ok(summary) => tracing::info!("Imported {} hosts from {}", summary.hosts, path.display()),
            Err(e) => {
                tracing::error!("{:#}", e);
                failed.push(path.to_path_buf());

                // Handler errors only come from a store that is gone for good
                if matches!(e.downcast_ref::<DecodeError>(), Some(DecodeError::Handler { .. })) {
                    return ImportOutcome {
                        totals: ingest.totals(),
                        failed,
                        aborted: true,
                    };
                }
            }
        }
    }

    ImportOutcome {
        totals: ingest.totals(),
        failed,
        aborted: false,
    }
}
