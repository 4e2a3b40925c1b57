//! Process events and the ordered hub that delivers them
//!
//! Every handle owns one [`EventHub`]. Stdout chunks, the buffered stderr
//! payload and the exit code all pass through it, so a subscriber that is
//! interested in several kinds sees them in the order they were emitted.
//!
//! Events emitted while nobody is interested in their kind are kept in an
//! ordered backlog and replayed to the first subscriber that is, so output
//! produced before the caller gets around to subscribing is not lost. The
//! backlog holds at most [`BACKLOG_LIMIT`] bytes of output, oldest dropped
//! first. Closing the hub releases it; only the exit event outlives the
//! process, and every later exit subscriber receives it.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::debug;

/// Output bytes held for subscribers that have not arrived yet
pub const BACKLOG_LIMIT: usize = 1024 * 1024;

/// Events emitted by a child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One chunk read from stdout
    Stdout(Vec<u8>),
    /// Entire stderr content, delivered once at termination
    Stderr(Vec<u8>),
    /// Process exited with the given code; always the last event
    Exit(i32),
}

impl ProcessEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Stdout(_) => EventKind::Stdout,
            Self::Stderr(_) => EventKind::Stderr,
            Self::Exit(_) => EventKind::Exit,
        }
    }

    /// Check if this is the terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit(_))
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Stdout(data) | Self::Stderr(data) => data.len(),
            Self::Exit(_) => 0,
        }
    }
}

/// Event discriminant used for subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Stdout data
    Stdout,
    /// Stderr data
    Stderr,
    /// Process exit
    Exit,
}

/// Set of event kinds a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Stdout data only
    pub const STDOUT: Self = Self(0b001);
    /// Stderr data only
    pub const STDERR: Self = Self(0b010);
    /// Exit only
    pub const EXIT: Self = Self(0b100);
    /// Every event
    pub const ALL: Self = Self(0b111);

    /// Whether `kind` is part of this set
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & Self::from(kind).0 != 0
    }
}

impl From<EventKind> for Interest {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Stdout => Self::STDOUT,
            EventKind::Stderr => Self::STDERR,
            EventKind::Exit => Self::EXIT,
        }
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Token returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ProcessEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    interest: Interest,
    callback: Callback,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<ProcessEvent>,
    backlog_bytes: usize,
    evicted: u64,
    /// Kept past `close` for late exit subscribers
    exit: Option<i32>,
    closed: bool,
}

impl HubState {
    fn push_backlog(&mut self, event: ProcessEvent) {
        self.backlog_bytes += event.payload_len();
        self.backlog.push_back(event);

        while self.backlog_bytes > BACKLOG_LIMIT && self.backlog.len() > 1 {
            let Some(oldest) = self.backlog.pop_front() else {
                break;
            };
            self.backlog_bytes -= oldest.payload_len();
            if self.evicted == 0 {
                debug!(limit = BACKLOG_LIMIT, "Event backlog full, dropping oldest output");
            }
            self.evicted += 1;
        }
    }
}

/// Ordered, multi-subscriber event delivery for one process
pub(crate) struct EventHub {
    /// Held for the whole of a delivery so replays and live events never
    /// interleave. Reentrant so callbacks may subscribe.
    delivery: ReentrantMutex<()>,
    state: Mutex<HubState>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(HubState::default()),
        }
    }

    /// Register a callback for the kinds in `interest`. Backlogged events of
    /// those kinds are replayed to it before this returns.
    pub(crate) fn subscribe<F>(&self, interest: Interest, callback: F) -> SubscriptionId
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        let _delivery = self.delivery.lock();
        let callback: Callback = Arc::new(callback);

        let (id, replay) = {
            let mut state = self.state.lock();
            let id = SubscriptionId(state.next_id);
            state.next_id += 1;

            // A closed hub never retains callbacks and only replays the exit
            if state.closed {
                let replay: VecDeque<_> = state
                    .exit
                    .filter(|_| interest.contains(EventKind::Exit))
                    .map(ProcessEvent::Exit)
                    .into_iter()
                    .collect();
                (id, replay)
            } else {
                let (replay, rest): (VecDeque<_>, VecDeque<_>) = state
                    .backlog
                    .drain(..)
                    .partition(|event| interest.contains(event.kind()));
                state.backlog_bytes = rest.iter().map(ProcessEvent::payload_len).sum();
                state.backlog = rest;

                state.subscribers.push(Subscriber {
                    id,
                    interest,
                    callback: Arc::clone(&callback),
                });
                (id, replay)
            }
        };

        for event in &replay {
            callback(event);
        }
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|subscriber| subscriber.id != id);
        state.subscribers.len() != before
    }

    /// Deliver an event to every interested subscriber in registration
    /// order, or backlog it if there are none.
    pub(crate) fn emit(&self, event: ProcessEvent) {
        let _delivery = self.delivery.lock();

        let recipients: Vec<Callback> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if let ProcessEvent::Exit(code) = &event {
                state.exit = Some(*code);
            }
            let recipients: Vec<Callback> = state
                .subscribers
                .iter()
                .filter(|subscriber| subscriber.interest.contains(event.kind()))
                .map(|subscriber| Arc::clone(&subscriber.callback))
                .collect();
            if recipients.is_empty() {
                state.push_backlog(event);
                return;
            }
            recipients
        };

        for callback in recipients {
            callback(&event);
        }
    }

    /// Stop accepting events, drop every registered callback and release
    /// the backlog. The exit code stays for late exit subscribers.
    pub(crate) fn close(&self) {
        let _delivery = self.delivery.lock();
        let (subscribers, backlog) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.backlog_bytes = 0;
            (
                std::mem::take(&mut state.subscribers),
                std::mem::take(&mut state.backlog),
            )
        };
        drop(subscribers);
        drop(backlog);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    #[cfg(test)]
    pub(crate) fn backlog_bytes(&self) -> usize {
        self.state.lock().backlog_bytes
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventHub")
            .field("subscribers", &state.subscribers.len())
            .field("backlog", &state.backlog.len())
            .field("backlog_bytes", &state.backlog_bytes)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(hub: &EventHub, interest: Interest) -> Arc<Mutex<Vec<ProcessEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hub.subscribe(interest, move |event| sink.lock().push(event.clone()));
        seen
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let hub = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hub.subscribe(Interest::ALL, move |_| order.lock().push(tag));
        }

        hub.emit(ProcessEvent::Exit(0));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_backlog_replayed_to_first_interested_subscriber() {
        let hub = EventHub::new();
        hub.emit(ProcessEvent::Stdout(b"one".to_vec()));
        hub.emit(ProcessEvent::Stdout(b"two".to_vec()));
        hub.emit(ProcessEvent::Exit(3));
        assert_eq!(hub.backlog_len(), 3);

        let exits = recorder(&hub, Interest::EXIT);
        assert_eq!(*exits.lock(), vec![ProcessEvent::Exit(3)]);
        assert_eq!(hub.backlog_len(), 2);

        let stdout = recorder(&hub, Interest::STDOUT);
        assert_eq!(
            *stdout.lock(),
            vec![
                ProcessEvent::Stdout(b"one".to_vec()),
                ProcessEvent::Stdout(b"two".to_vec()),
            ]
        );
        assert_eq!(hub.backlog_len(), 0);

        let late = recorder(&hub, Interest::STDOUT);
        assert!(late.lock().is_empty());
    }

    #[test]
    fn test_filtering_by_interest() {
        let hub = EventHub::new();
        let stderr = recorder(&hub, Interest::STDERR);
        let all = recorder(&hub, Interest::STDOUT | Interest::EXIT);

        hub.emit(ProcessEvent::Stdout(vec![0, 1, 0]));
        hub.emit(ProcessEvent::Stderr(b"oops".to_vec()));
        hub.emit(ProcessEvent::Exit(1));

        assert_eq!(*stderr.lock(), vec![ProcessEvent::Stderr(b"oops".to_vec())]);
        assert_eq!(
            *all.lock(),
            vec![ProcessEvent::Stdout(vec![0, 1, 0]), ProcessEvent::Exit(1)]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let id = hub.subscribe(Interest::ALL, move |_| *counter.lock() += 1);

        hub.emit(ProcessEvent::Stdout(b"x".to_vec()));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(ProcessEvent::Stdout(b"y".to_vec()));

        assert_eq!(*seen.lock(), 1);
        assert_eq!(hub.backlog_len(), 1);
    }

    #[test]
    fn test_close_drops_callbacks_and_ignores_emits() {
        let hub = EventHub::new();
        let seen = recorder(&hub, Interest::ALL);
        hub.emit(ProcessEvent::Exit(0));
        hub.close();

        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(ProcessEvent::Stdout(b"late".to_vec()));
        assert_eq!(*seen.lock(), vec![ProcessEvent::Exit(0)]);
        assert_eq!(hub.backlog_len(), 0);

        // Delivered before close, still replayed afterwards
        let late = recorder(&hub, Interest::EXIT);
        assert_eq!(*late.lock(), vec![ProcessEvent::Exit(0)]);
    }

    #[test]
    fn test_close_releases_output_backlog() {
        let hub = EventHub::new();
        let exits = recorder(&hub, Interest::EXIT);
        hub.emit(ProcessEvent::Stdout(vec![7; 4096]));
        hub.emit(ProcessEvent::Stderr(b"warn".to_vec()));
        hub.emit(ProcessEvent::Exit(9));
        assert_eq!(hub.backlog_len(), 2);

        hub.close();
        assert_eq!(hub.backlog_len(), 0);
        assert_eq!(hub.backlog_bytes(), 0);
        assert_eq!(*exits.lock(), vec![ProcessEvent::Exit(9)]);

        // Every late subscriber gets the exit, none gets output
        let first = recorder(&hub, Interest::ALL);
        let second = recorder(&hub, Interest::STDOUT | Interest::EXIT);
        let stdout_only = recorder(&hub, Interest::STDOUT);
        assert_eq!(*first.lock(), vec![ProcessEvent::Exit(9)]);
        assert_eq!(*second.lock(), vec![ProcessEvent::Exit(9)]);
        assert!(stdout_only.lock().is_empty());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_backlog_drops_oldest_output_past_limit() {
        let hub = EventHub::new();
        let chunk = 64 * 1024;
        let chunks = 2 * BACKLOG_LIMIT / chunk;
        for i in 0..chunks {
            hub.emit(ProcessEvent::Stdout(vec![(i % 251) as u8; chunk]));
        }
        assert!(hub.backlog_bytes() <= BACKLOG_LIMIT);
        assert_eq!(hub.backlog_len(), BACKLOG_LIMIT / chunk);

        let seen = recorder(&hub, Interest::STDOUT);
        let seen = seen.lock();
        let first_kept = chunks - BACKLOG_LIMIT / chunk;
        assert_eq!(seen[0], ProcessEvent::Stdout(vec![(first_kept % 251) as u8; chunk]));
        assert_eq!(
            seen.last(),
            Some(&ProcessEvent::Stdout(vec![((chunks - 1) % 251) as u8; chunk]))
        );
        assert_eq!(hub.backlog_bytes(), 0);
    }

    #[test]
    fn test_subscribe_from_inside_callback() {
        let hub = Arc::new(EventHub::new());
        let nested = Arc::new(Mutex::new(Vec::new()));

        let hub_ref = Arc::clone(&hub);
        let nested_ref = Arc::clone(&nested);
        hub.subscribe(Interest::STDOUT, move |_| {
            let nested_ref = Arc::clone(&nested_ref);
            hub_ref.subscribe(Interest::EXIT, move |event| nested_ref.lock().push(event.clone()));
        });

        hub.emit(ProcessEvent::Stdout(b"go".to_vec()));
        hub.emit(ProcessEvent::Exit(0));
        assert_eq!(*nested.lock(), vec![ProcessEvent::Exit(0)]);
    }
}
