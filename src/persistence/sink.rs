//! Serial snapshot writer.
//!
//! One worker task owns the merged snapshot and is the only writer of the store.
//! Commands arrive over an unbounded channel, so writes complete in the order
//! `persist` was called and never overlap. Patches that queue up while a write is
//! in flight are merged and land in a single follow-up write.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::{LedgerSnapshot, SnapshotStore};
use crate::observability::LedgerMetrics;

enum SinkCommand {
    Persist(LedgerSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence worker. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct PersistenceSink {
    tx: Option<mpsc::UnboundedSender<SinkCommand>>,
}

impl PersistenceSink {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// `initial` seeds the merge cache so that the first partial write does not
    /// drop fields loaded at startup.
    pub fn spawn(
        store: Arc<dyn SnapshotStore>,
        initial: LedgerSnapshot,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store, initial, rx, metrics));
        Self { tx: Some(tx) }
    }

    /// A sink that drops every patch. Ledgers built with it are purely in-memory.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a partial snapshot. Never blocks and never fails the caller.
    pub fn persist(&self, patch: LedgerSnapshot) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(SinkCommand::Persist(patch)).is_err() {
            tracing::warn!("Persistence worker stopped; snapshot update dropped");
        }
    }

    /// Resolve once every patch queued before this call has been written (or failed).
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(SinkCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker(
    store: Arc<dyn SnapshotStore>,
    mut cache: LedgerSnapshot,
    mut rx: mpsc::UnboundedReceiver<SinkCommand>,
    metrics: Arc<LedgerMetrics>,
) {
    let mut waiters = Vec::new();

    while let Some(command) = rx.recv().await {
        let mut dirty = false;
        let mut next = Some(command);

        // Coalesce whatever is already queued behind this command.
        while let Some(command) = next {
            match command {
                SinkCommand::Persist(patch) => {
                    cache.merge(patch);
                    dirty = true;
                }
                SinkCommand::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if dirty {
            match store.save(&cache).await {
                Ok(()) => {
                    metrics.persist_writes.inc();
                    tracing::debug!(store = store.name(), "Ledger snapshot written");
                }
                Err(e) => {
                    metrics.persist_failures.inc();
                    tracing::warn!(
                        store = store.name(),
                        error = %e,
                        "Failed to write ledger snapshot; in-memory state remains authoritative"
                    );
                }
            }
        }

        for done in waiters.drain(..) {
            let _ = done.send(());
        }
    }

    tracing::debug!(store = store.name(), "Persistence worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::persistence::MemoryStore;
    use crate::{Error, Result};

    fn paid(tenant: &str, until: i64) -> LedgerSnapshot {
        LedgerSnapshot {
            paid_until_by_tenant: Some(BTreeMap::from([(tenant.to_string(), until)])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_last_write_wins_in_call_order() {
        let store = MemoryStore::new();
        let sink = PersistenceSink::spawn(
            Arc::new(store.clone()),
            LedgerSnapshot::default(),
            Arc::new(LedgerMetrics::new()),
        );

        for until in 1..=50 {
            sink.persist(paid("t", until));
        }
        sink.flush().await;

        let saved = store.current().await.unwrap();
        assert_eq!(saved.paid_until_by_tenant.unwrap()["t"], 50);
        assert!(store.save_count() >= 1);
    }

    #[tokio::test]
    async fn test_merges_onto_initial_snapshot() {
        let store = MemoryStore::new();
        let initial = LedgerSnapshot {
            admin_tenant_list: Some(vec!["root".to_string()]),
            ..Default::default()
        };
        let sink = PersistenceSink::spawn(
            Arc::new(store.clone()),
            initial,
            Arc::new(LedgerMetrics::new()),
        );

        sink.persist(paid("t", 7));
        sink.flush().await;

        let saved = store.current().await.unwrap();
        assert_eq!(saved.admin_tenant_list, Some(vec!["root".to_string()]));
        assert_eq!(saved.paid_until_by_tenant.unwrap()["t"], 7);
    }

    struct FailingStore {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SnapshotStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn load(&self) -> Result<Option<LedgerSnapshot>> {
            Ok(None)
        }

        async fn save(&self, _snapshot: &LedgerSnapshot) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::persistence("disk full"))
        }
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let store = Arc::new(FailingStore {
            attempts: AtomicUsize::new(0),
        });
        let metrics = Arc::new(LedgerMetrics::new());
        let sink =
            PersistenceSink::spawn(store.clone(), LedgerSnapshot::default(), metrics.clone());

        sink.persist(paid("t", 1));
        sink.flush().await;
        sink.persist(paid("t", 2));
        sink.flush().await;

        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.persist_failures.get(), 2);
        assert_eq!(metrics.persist_writes.get(), 0);
    }

    #[tokio::test]
    async fn test_disabled_sink_is_noop() {
        let sink = PersistenceSink::disabled();
        assert!(!sink.is_enabled());
        sink.persist(paid("t", 1));
        sink.flush().await;
    }
}
