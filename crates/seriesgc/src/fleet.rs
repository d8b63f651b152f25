//! Thread-per-actor packaging of the protocol.
//!
//! The library's actors are synchronous; this module runs them as
//! independently scheduled threads with no central arbiter, which is the
//! deployment shape the protocol assumes: ingest workers consume batches
//! from channels, a garbage collector ticks through its phases, and the
//! single refresh actor sweeps the fleet.
//!
//! ```text
//! submit(worker, batch) ──► ingest worker 0..N ──► backend + own cache
//! expire(ids)           ──► collector (DropChunkData)
//! gc ticker             ──► advance / mark / delete cycle
//! refresh ticker        ──► refresher.refresh_all()
//! ```
//!
//! Shutdown drains the batch queues: workers finish everything already
//! submitted before exiting.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{info, warn};

use crate::cache::WorkerCache;
use crate::collector::GarbageCollector;
use crate::config::ProtocolConfig;
use crate::epoch::SeriesId;
use crate::error::Result;
use crate::ingest::Ingestor;
use crate::refresh::CacheRefresher;
use crate::store::InMemoryBackend;
use crate::telemetry::{CountersSnapshot, ProtocolCounters};

/// A running fleet: ingest workers, collector ticker, refresh ticker.
pub struct ProtocolFleet {
    backend: Arc<InMemoryBackend>,
    caches: Vec<Arc<WorkerCache>>,
    counters: Arc<ProtocolCounters>,
    collector: GarbageCollector<InMemoryBackend>,
    batch_txs: Vec<Sender<Vec<SeriesId>>>,
    shutdown_tx: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl ProtocolFleet {
    /// Validate the config and start every actor thread.
    pub fn start(config: &ProtocolConfig) -> Result<Self> {
        config.validate()?;

        let backend = Arc::new(InMemoryBackend::new(1));
        let counters = Arc::new(ProtocolCounters::default());
        let caches: Vec<Arc<WorkerCache>> =
            (0..config.worker_count).map(|w| Arc::new(WorkerCache::new(w))).collect();
        let refresher = Arc::new(CacheRefresher::new(
            Arc::clone(&backend),
            caches.clone(),
            Arc::clone(&counters),
        ));
        let collector =
            GarbageCollector::new(Arc::clone(&backend), config.delay, Arc::clone(&counters));

        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let mut handles = Vec::new();
        let mut batch_txs = Vec::new();

        for worker in 0..config.worker_count {
            let (tx, rx) = unbounded::<Vec<SeriesId>>();
            batch_txs.push(tx);
            let ingestor = Ingestor::new(
                worker,
                Arc::clone(&caches[worker]),
                Arc::clone(&backend),
                Arc::clone(&refresher),
                Arc::clone(&counters),
                config.max_ingest_retries,
            );
            handles.push(
                std::thread::Builder::new()
                    .name(format!("seriesgc-worker-{worker}"))
                    .spawn(move || ingest_loop(&ingestor, &rx))?,
            );
        }

        handles.push(spawn_gc_ticker(
            collector.clone(),
            config.gc.tick_ms,
            config.gc.advance_per_tick,
            shutdown_rx.clone(),
        )?);
        handles.push(spawn_refresh_ticker(
            Arc::clone(&refresher),
            config.refresh_tick_ms,
            shutdown_rx,
        )?);

        info!(workers = config.worker_count, delay = config.delay, "fleet started");
        Ok(Self { backend, caches, counters, collector, batch_txs, shutdown_tx, handles })
    }

    /// Queue a batch for a worker. Returns false once the fleet is
    /// shutting down.
    pub fn submit(&self, worker: usize, batch: Vec<SeriesId>) -> bool {
        self.batch_txs[worker].send(batch).is_ok()
    }

    /// Expire data references (DropChunkData), called by the storage
    /// collaborator when chunks age out.
    pub fn expire(&self, ids: &[SeriesId]) -> usize {
        self.collector.drop_chunk_data(ids)
    }

    /// The shared backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<InMemoryBackend> {
        &self.backend
    }

    /// The worker caches.
    #[must_use]
    pub fn caches(&self) -> &[Arc<WorkerCache>] {
        &self.caches
    }

    /// Current protocol counters.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Stop every actor, draining already-submitted batches first.
    pub fn shutdown(self) -> CountersSnapshot {
        drop(self.batch_txs);
        drop(self.shutdown_tx);
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("actor thread panicked during shutdown");
            }
        }
        self.counters.snapshot()
    }
}

fn ingest_loop(ingestor: &Ingestor<InMemoryBackend>, rx: &Receiver<Vec<SeriesId>>) {
    while let Ok(batch) = rx.recv() {
        if let Err(error) = ingestor.ingest(&batch) {
            warn!(worker = ingestor.worker(), %error, "ingest batch failed");
        }
    }
}

fn spawn_gc_ticker(
    collector: GarbageCollector<InMemoryBackend>,
    tick_ms: u64,
    advance_per_tick: u64,
    shutdown_rx: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("seriesgc-gc".into()).spawn(move || {
        loop {
            match shutdown_rx.recv_timeout(Duration::from_millis(tick_ms)) {
                Err(RecvTimeoutError::Timeout) => {
                    collector.advance_now(advance_per_tick);
                    collector.mark_unused();
                    collector.run_delete_cycle();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

fn spawn_refresh_ticker(
    refresher: Arc<CacheRefresher<InMemoryBackend>>,
    tick_ms: u64,
    shutdown_rx: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("seriesgc-refresh".into()).spawn(move || {
        loop {
            match shutdown_rx.recv_timeout(Duration::from_millis(tick_ms)) {
                Err(RecvTimeoutError::Timeout) => {
                    refresher.refresh_all();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}
