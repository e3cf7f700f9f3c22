//! Background delivery
//!
//! The dispatcher drains a bounded queue on a tokio task, sending events in
//! submission order so a begin always reaches the service before its end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{degrade, ClientError, Delivery, Event, HttpTransport, Sink, TracerConfig};

enum Command {
    Deliver(Event),
    Flush(oneshot::Sender<()>),
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    degraded: AtomicU64,
}

impl DispatchStats {
    /// Events the service acknowledged
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events lost after being queued or at submission
    pub fn degraded(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }

    fn record(&self, delivery: &Delivery) {
        let counter = if delivery.is_degraded() {
            &self.degraded
        } else {
            &self.delivered
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Non-blocking event sink backed by a background task
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Start a dispatcher for the service in `config`.
    ///
    /// Must be called from within a Tokio runtime. A configuration that
    /// cannot produce a transport yields a dispatcher that degrades every
    /// event.
    pub fn spawn(config: &TracerConfig) -> Self {
        match HttpTransport::new(config) {
            Ok(transport) => Self::new(transport, config.queue_capacity),
            Err(e) => {
                error!(error = %e, "Tracing transport unavailable, events will be dropped");
                Self::closed()
            }
        }
    }

    /// Start a dispatcher sending through `transport`
    pub fn new(transport: HttpTransport, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(DispatchStats::default());
        let worker = tokio::spawn(run(transport, rx, Arc::clone(&stats)));
        debug!("Tracing dispatcher started (capacity={})", capacity);

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    fn closed() -> Self {
        Self {
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Delivery counters
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Wait until every event submitted so far has been sent
    pub async fn flush(&self) {
        let Some(tx) = self.tx.lock().clone() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Deliver what is queued, stop the worker and release its connections.
    /// Events submitted afterwards are degraded.
    pub async fn shutdown(&self) {
        // dropping the last sender ends the worker once the queue is empty
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Tracing dispatcher stopped abnormally");
            }
            info!(
                delivered = self.stats.delivered(),
                degraded = self.stats.degraded(),
                "Tracing dispatcher shut down"
            );
        }
    }
}

impl Sink for Dispatcher {
    fn submit(&self, event: Event) -> Delivery {
        let kind = event.kind();
        let error = match self.tx.lock().as_ref() {
            None => ClientError::Closed,
            Some(tx) => match tx.try_send(Command::Deliver(event)) {
                Ok(()) => return Delivery::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => ClientError::QueueFull,
                Err(mpsc::error::TrySendError::Closed(_)) => ClientError::Closed,
            },
        };
        let delivery = degrade(kind, &error);
        self.stats.record(&delivery);
        delivery
    }
}

async fn run(transport: HttpTransport, mut rx: mpsc::Receiver<Command>, stats: Arc<DispatchStats>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Deliver(event) => {
                let delivery = transport.send(&event).await;
                stats.record(&delivery);
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Tracing dispatcher queue drained");
}
