//! One loaded sink: its bounded ring, its worker thread, its counters.
//!
//! The producer side never blocks: a full ring drops the new record and
//! bumps the `dropped` counter. The worker drains FIFO, one record per
//! `publish` call, and never retries. On stop the worker finishes the
//! queue, hands the sink back, and lifecycle callbacks run on the
//! manager's thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::error::{StreamError, StreamResult};
use crate::publish::api::{Publisher, PublisherConfig, PublisherContext};
use crate::record::CdcEvent;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct QueueState {
    ring: VecDeque<CdcEvent>,
    stop: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    cond: Condvar,
    capacity: usize,
}

pub struct PublisherInstance {
    pub name: String,
    pub active: bool,
    started: bool,
    config: PublisherConfig,
    context: PublisherContext,
    queue: Arc<QueueShared>,
    worker: Option<JoinHandle<Box<dyn Publisher>>>,
    /// Parked here before start and again after stop, for cleanup.
    publisher: Option<Box<dyn Publisher>>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl PublisherInstance {
    pub fn new(publisher: Box<dyn Publisher>, config: PublisherConfig) -> PublisherInstance {
        let capacity = if config.max_queue_depth > 0 {
            config.max_queue_depth
        } else {
            DEFAULT_QUEUE_CAPACITY
        };
        PublisherInstance {
            name: config.name.clone(),
            active: config.active,
            started: false,
            context: PublisherContext::for_sink(&config.name),
            config,
            queue: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    ring: VecDeque::with_capacity(capacity),
                    stop: false,
                }),
                cond: Condvar::new(),
                capacity,
            }),
            worker: None,
            publisher: Some(publisher),
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn schema_filter(&self) -> &[String] {
        &self.config.schema_filter
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn init(&mut self) -> StreamResult<()> {
        let publisher = self
            .publisher
            .as_mut()
            .ok_or_else(|| StreamError::Publisher(format!("{}: no sink to init", self.name)))?;
        publisher.init(&self.context, &self.config)
    }

    /// Call the sink's `start` and spawn the worker.
    pub fn start(&mut self) -> StreamResult<()> {
        if !self.active {
            return Err(StreamError::Publisher(format!("{}: inactive", self.name)));
        }
        if self.started {
            return Ok(());
        }
        let mut publisher = self
            .publisher
            .take()
            .ok_or_else(|| StreamError::Publisher(format!("{}: no sink to start", self.name)))?;
        publisher.start()?;

        let queue = Arc::clone(&self.queue);
        let published = Arc::clone(&self.published);
        let errors = Arc::clone(&self.errors);
        let name = self.name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("publisher-{}", name))
            .spawn(move || {
                info!("publisher worker started: {}", name);
                loop {
                    let mut state = queue.state.lock().unwrap();
                    while state.ring.is_empty() && !state.stop {
                        state = queue.cond.wait(state).unwrap();
                    }
                    if state.stop && state.ring.is_empty() {
                        break;
                    }
                    let event = state.ring.pop_front().unwrap();
                    queue.cond.notify_all();
                    drop(state);

                    match publisher.publish(&event) {
                        Ok(()) => {
                            published.fetch_add(1, Ordering::Release);
                        }
                        Err(e) => {
                            errors.fetch_add(1, Ordering::Release);
                            warn!("publisher {} failed to publish event: {}", name, e);
                        }
                    }
                }
                info!("publisher worker exiting: {}", name);
                publisher
            })
            .map_err(|e| StreamError::Publisher(format!("spawn worker: {}", e)))?;
        self.worker = Some(worker);
        self.started = true;
        Ok(())
    }

    /// Producer path. Deep-copies the record into the ring; a full ring
    /// drops it instead of blocking the decoder.
    pub fn enqueue(&self, event: &CdcEvent) {
        if !self.active || !self.started {
            return;
        }
        let mut state = self.queue.state.lock().unwrap();
        if state.ring.len() >= self.queue.capacity {
            drop(state);
            self.dropped.fetch_add(1, Ordering::Release);
            warn!("publisher {} queue full, dropping event", self.name);
            return;
        }
        state.ring.push_back(event.clone());
        self.queue.cond.notify_one();
    }

    /// Stop the worker (draining the queue), then call the sink's `stop`.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        {
            let mut state = self.queue.state.lock().unwrap();
            state.stop = true;
            self.queue.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(mut publisher) => {
                    if let Err(e) = publisher.stop() {
                        warn!("publisher {} stop callback failed: {}", self.name, e);
                    }
                    self.publisher = Some(publisher);
                }
                Err(_) => warn!("publisher {} worker panicked", self.name),
            }
        }
        self.started = false;
        info!(
            "publisher {} stopped (published={}, dropped={}, errors={})",
            self.name,
            self.published(),
            self.dropped(),
            self.errors()
        );
    }

    pub fn cleanup(&mut self) {
        if let Some(mut publisher) = self.publisher.take() {
            publisher.cleanup();
        }
    }

    pub fn health_check(&self) -> bool {
        self.publisher
            .as_ref()
            .map(|p| p.health_check())
            .unwrap_or(true)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    /// Records everything it publishes; optionally blocks forever per
    /// event to model a wedged sink.
    pub struct ProbeSink {
        pub name: String,
        pub sender: Option<Sender<CdcEvent>>,
        pub block: bool,
        pub fail: bool,
    }

    impl Publisher for ProbeSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn init(&mut self, _ctx: &PublisherContext, _config: &PublisherConfig) -> StreamResult<()> {
            Ok(())
        }

        fn publish(&mut self, event: &CdcEvent) -> StreamResult<()> {
            if self.block {
                loop {
                    std::thread::sleep(Duration::from_secs(3600));
                }
            }
            if let Some(sender) = &self.sender {
                sender.send(event.clone()).ok();
            }
            if self.fail {
                return Err(StreamError::Publisher("probe failure".to_string()));
            }
            Ok(())
        }
    }

    pub fn event(schema: &str, n: u64) -> CdcEvent {
        CdcEvent {
            db: schema.to_string(),
            table: "t".to_string(),
            json: format!("{{\"n\":{}}}", n),
            txn: "txn".to_string(),
            position: n,
            file: String::new(),
        }
    }
}
