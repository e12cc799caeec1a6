//! Merges every note source into one deduplicated stream.
//!
//! Producers call [`EventUnifier::ingest`], which only appends to a bounded
//! ring and wakes the consumer. A single consumer task owns the dedup table
//! and the active-note set; readers get the set through a published copy.
//!
//! Ordering: events from one source keep their arrival order. There is no
//! total order across sources, and an event ingested while a drain is
//! taking its snapshot lands in the next drain. Both are accepted in
//! exchange for ingest never blocking on the consumer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::UnifierSettings;
use crate::hub::{CoreEvent, EventHub};
use crate::note::{ActiveNoteRecord, DedupKey, NoteEvent, NoteKind, SourceKind, UnifiedEvent};

#[derive(Debug, Default)]
struct Counters {
    ingested: AtomicU64,
    duplicates: AtomicU64,
    overflows: AtomicU64,
    published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnifierStats {
    pub ingested: u64,
    pub duplicates: u64,
    pub overflows: u64,
    pub published: u64,
}

struct Inbox {
    queue: Mutex<VecDeque<UnifiedEvent>>,
    capacity: usize,
    notify: Notify,
}

impl Inbox {
    fn take_all(&self) -> VecDeque<UnifiedEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    }
}

/// Dedup table plus the active-note set. Owned by the consumer.
#[derive(Debug)]
pub struct DedupState {
    window: Duration,
    recent: HashMap<DedupKey, Instant>,
    active: BTreeMap<u8, ActiveNoteRecord>,
}

impl DedupState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
            active: BTreeMap::new(),
        }
    }

    /// Returns the event to republish, or `None` when it duplicates one
    /// accepted within the window.
    pub fn process(&mut self, mut unified: UnifiedEvent) -> Option<UnifiedEvent> {
        let stamp = unified.event.timestamp;
        if let Some(seen) = self.recent.get(&unified.key) {
            if stamp.saturating_duration_since(*seen) <= self.window {
                return None;
            }
        }
        self.recent.insert(unified.key, stamp);

        let event = &unified.event;
        match event.kind {
            NoteKind::On if event.velocity > 0 => {
                self.active.insert(
                    event.note,
                    ActiveNoteRecord {
                        note: event.note,
                        source: unified.source,
                        source_id: event.source_id.clone(),
                        timestamp: event.timestamp,
                        velocity: event.velocity,
                        channel: event.channel,
                    },
                );
            }
            // note-off, or note-on with velocity 0
            _ => {
                self.active.remove(&event.note);
            }
        }

        unified.processed = true;
        Some(unified)
    }

    /// Forget dedup entries older than the window as of `now`.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.recent
            .retain(|_, seen| now.saturating_duration_since(*seen) <= window);
    }

    pub fn active(&self) -> &BTreeMap<u8, ActiveNoteRecord> {
        &self.active
    }
}

struct Worker {
    handle: JoinHandle<DedupState>,
    stop: oneshot::Sender<()>,
}

pub struct EventUnifier {
    inbox: Arc<Inbox>,
    counters: Arc<Counters>,
    active: Arc<RwLock<BTreeMap<u8, ActiveNoteRecord>>>,
    hub: EventHub,
    state: Mutex<Option<DedupState>>,
    worker: Mutex<Option<Worker>>,
    window: Duration,
    stop_timeout: Duration,
}

impl EventUnifier {
    pub fn new(settings: &UnifierSettings, hub: EventHub) -> Self {
        let window = Duration::from_millis(settings.dedup_window_ms);
        Self {
            inbox: Arc::new(Inbox {
                queue: Mutex::new(VecDeque::with_capacity(settings.buffer_capacity)),
                capacity: settings.buffer_capacity.max(1),
                notify: Notify::new(),
            }),
            counters: Arc::new(Counters::default()),
            active: Arc::new(RwLock::new(BTreeMap::new())),
            hub,
            state: Mutex::new(Some(DedupState::new(window))),
            worker: Mutex::new(None),
            window,
            stop_timeout: Duration::from_secs(1),
        }
    }

    /// Queue an event. Never blocks; when the ring is full the oldest entry
    /// is dropped.
    pub fn ingest(&self, source: SourceKind, event: NoteEvent) {
        let unified = UnifiedEvent::new(source, event);
        {
            let mut queue = self.inbox.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.inbox.capacity {
                queue.pop_front();
                let dropped = self.counters.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    log::warn!("unifier buffer full, dropped oldest event ({dropped} so far)");
                }
            }
            queue.push_back(unified);
        }
        self.counters.ingested.fetch_add(1, Ordering::Relaxed);
        self.inbox.notify.notify_one();
    }

    /// Spawn the consumer task on the current runtime. No-op if running.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return;
        }
        let Some(state) = self.state.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            log::error!("unifier state lost, cannot start");
            return;
        };

        let (stop, stop_rx) = oneshot::channel();
        let consumer = Consumer {
            inbox: Arc::clone(&self.inbox),
            counters: Arc::clone(&self.counters),
            active: Arc::clone(&self.active),
            hub: self.hub.clone(),
            state,
        };
        let handle = tokio::spawn(consumer.run(stop_rx));
        *worker = Some(Worker { handle, stop });
        log::info!("event unifier started");
    }

    /// Stop the consumer after a final drain.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Worker { mut handle, stop }) = worker else {
            return;
        };
        let _ = stop.send(());
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(state)) => {
                *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
                log::info!("event unifier stopped");
            }
            Ok(Err(e)) => {
                log::error!("unifier task failed: {e}");
                self.reset_state();
            }
            Err(_) => {
                log::warn!("unifier did not stop in time, aborting");
                handle.abort();
                self.reset_state();
            }
        }
    }

    fn reset_state(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(DedupState::new(self.window));
        self.active.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Currently sounding notes, lowest first.
    pub fn active_notes(&self) -> Vec<ActiveNoteRecord> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.values().cloned().collect()
    }

    pub fn is_active(&self, note: u8) -> bool {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&note)
    }

    pub fn pending(&self) -> usize {
        self.inbox.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> UnifierStats {
        UnifierStats {
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
        }
    }
}

struct Consumer {
    inbox: Arc<Inbox>,
    counters: Arc<Counters>,
    active: Arc<RwLock<BTreeMap<u8, ActiveNoteRecord>>>,
    hub: EventHub,
    state: DedupState,
}

impl Consumer {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> DedupState {
        let inbox = Arc::clone(&self.inbox);
        loop {
            tokio::select! {
                _ = inbox.notify.notified() => self.drain(),
                _ = &mut stop => break,
            }
        }
        // events ingested before the stop request still count
        self.drain();
        self.state
    }

    fn drain(&mut self) {
        let batch = self.inbox.take_all();
        if batch.is_empty() {
            return;
        }

        let mut last_stamp = None;
        for unified in batch {
            last_stamp = Some(unified.event.timestamp);
            match self.state.process(unified) {
                Some(accepted) => {
                    self.publish_active(accepted.event.note);
                    log::debug!(
                        "note {:?} {} vel {} from {:?}",
                        accepted.event.kind,
                        accepted.event.note,
                        accepted.event.velocity,
                        accepted.source
                    );
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    self.hub.publish(CoreEvent::Note(accepted));
                }
                None => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if let Some(stamp) = last_stamp {
            self.state.prune(stamp);
        }
    }

    /// Mirror one note of the owned set into the shared read view.
    fn publish_active(&self, note: u8) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        match self.state.active().get(&note) {
            Some(record) => {
                active.insert(note, record.clone());
            }
            None => {
                active.remove(&note);
            }
        }
    }
}
