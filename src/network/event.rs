use mio::event::Event;
use std::fmt;

/// Readiness record copied out of the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl RawEvent {
    /// Peer went away or the socket failed
    pub fn is_hangup(&self) -> bool {
        self.error || self.read_closed
    }
}

impl From<&Event> for RawEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token().0,
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

/// Fixed-size circular event queue.
///
/// One slot always stays empty so `head == tail` means empty; a ring of
/// capacity `n` holds at most `n - 1` events.
pub struct EventRing {
    events: Box<[RawEvent]>,
    head: usize,
    tail: usize,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "event ring needs room for one event");
        Self {
            events: vec![RawEvent::default(); capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        (self.tail + self.events.len() - self.head) % self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Events that can still be pushed
    pub fn free(&self) -> usize {
        self.events.len() - 1 - self.len()
    }

    pub fn push(&mut self, event: RawEvent) -> bool {
        if self.free() == 0 {
            return false;
        }
        self.events[self.tail] = event;
        self.tail = (self.tail + 1) % self.events.len();
        true
    }

    /// Push all of `events` or none of them.
    pub fn extend(&mut self, events: &[RawEvent]) -> bool {
        if self.free() < events.len() {
            return false;
        }
        for event in events {
            self.events[self.tail] = *event;
            self.tail = (self.tail + 1) % self.events.len();
        }
        true
    }

    pub fn pop(&mut self) -> Option<RawEvent> {
        if self.is_empty() {
            return None;
        }
        let event = self.events[self.head];
        self.head = (self.head + 1) % self.events.len();
        Some(event)
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

impl fmt::Debug for EventRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRing")
            .field("capacity", &self.events.len())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
