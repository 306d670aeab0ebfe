//! Transfer service - async front of the transfer core
//!
//! The `TransferManager` is a synchronous single owner. `TransferService`
//! moves it into one tokio task and serializes every mutation through that
//! task's mailbox, so callers on any thread see one consistent core. The
//! task also drives the scheduler tick, saves the source set periodically
//! and on shutdown, and broadcasts every `TransferEvent`.

use crate::assembly::FileSpec;
use crate::error::{Result, TransferError};
use crate::events::TransferEvent;
use crate::persist::{PersistenceStore, SourceRecord};
use crate::transfer::{NewSource, TickReport, TransferManager};
use crate::types::{FileId, SourceId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pending calls before senders wait
const MAILBOX_CAPACITY: usize = 256;

type Job = Box<dyn FnOnce(&mut TransferManager) + Send>;

/// Handle to a running transfer core
pub struct TransferService {
    jobs: mpsc::Sender<Job>,
    event_tx: broadcast::Sender<TransferEvent>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransferService {
    /// Restore persisted Sources into `manager` and start its task
    pub async fn start(
        mut manager: TransferManager,
        store: Option<Arc<dyn PersistenceStore>>,
    ) -> Result<Self> {
        if let Some(store) = &store {
            let records = store.load().await?;
            if !records.is_empty() {
                manager.restore(&records)?;
            }
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (jobs, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            manager,
            mailbox,
            event_tx.clone(),
            store,
            shutdown.clone(),
        ));

        Ok(Self {
            jobs,
            event_tx,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Run `f` on the core and return its result
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut TransferManager) -> R + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(TransferError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |manager: &mut TransferManager| {
            let _ = tx.send(f(manager));
        });
        self.jobs.send(job).await.map_err(|_| TransferError::Shutdown)?;
        rx.await.map_err(|_| TransferError::Shutdown)
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    pub async fn add_file(&self, spec: FileSpec) -> Result<FileId> {
        self.call(move |m| m.add_file(spec)).await?
    }

    pub async fn add_source(&self, file: FileId, source: NewSource) -> Result<SourceId> {
        self.call(move |m| m.add_source(file, source)).await?
    }

    pub async fn stop(&self, id: SourceId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.call(move |m| m.stop(id, &reason)).await?
    }

    pub async fn remove_source(&self, id: SourceId) -> Result<()> {
        self.call(move |m| m.remove_source(id)).await?
    }

    /// Run a scheduling pass now instead of waiting for the next tick
    pub async fn tick(&self) -> Result<TickReport> {
        self.call(|m| m.tick()).await
    }

    pub async fn running_count(&self) -> Result<usize> {
        self.call(|m| m.running_count()).await
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the task after a final save
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| TransferError::Internal(format!("Service task failed: {}", e)))?;
        }
        tracing::info!("Transfer service stopped");
        Ok(())
    }
}

impl Drop for TransferService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    mut manager: TransferManager,
    mut mailbox: mpsc::Receiver<Job>,
    event_tx: broadcast::Sender<TransferEvent>,
    store: Option<Arc<dyn PersistenceStore>>,
    shutdown: CancellationToken,
) {
    let mut ticks = tokio::time::interval(Duration::from_millis(manager.config().tick_interval_ms));
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut saves = tokio::time::interval(Duration::from_secs(
        manager.config().persist_interval_secs,
    ));
    saves.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately
    saves.tick().await;

    loop {
        tokio::select! {
            Some(job) = mailbox.recv() => job(&mut manager),
            _ = ticks.tick() => {
                manager.tick();
            }
            _ = saves.tick() => {
                let records = manager.snapshot_records();
                if let Err(e) = save(store.as_deref(), records).await {
                    tracing::warn!("Failed to persist sources: {}", e);
                }
            }
            _ = shutdown.cancelled() => {
                let records = manager.snapshot_records();
                if let Err(e) = save(store.as_deref(), records).await {
                    tracing::warn!("Failed to persist sources on shutdown: {}", e);
                }
                publish(&mut manager, &event_tx);
                break;
            }
        }
        publish(&mut manager, &event_tx);
    }
}

fn publish(manager: &mut TransferManager, event_tx: &broadcast::Sender<TransferEvent>) {
    for event in manager.drain_events() {
        // No subscribers is fine
        let _ = event_tx.send(event);
    }
}

async fn save(store: Option<&dyn PersistenceStore>, records: Vec<SourceRecord>) -> Result<()> {
    let Some(store) = store else {
        return Ok(());
    };
    store.save(&records).await
}
