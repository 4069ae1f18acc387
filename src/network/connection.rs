use super::event::EventRing;
use crate::io::Buffer;
use crate::sync::HybridRwLock;
use crossbeam_queue::SegQueue;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::io;
use tracing::trace;

/// Arena index reserved for the listening socket
pub const LISTENER: usize = 0;

/// Connection state machine
///
/// `Free -> Waiting` on accept, `Waiting <-> Running` while events are
/// served, back to `Free` on hang-up or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Free,
    Waiting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnClass {
    Listener,
    Message,
}

/// Scheduling half of a connection slot, held only briefly
#[derive(Debug)]
pub struct SlotState {
    pub generation: u32,
    pub state: ConnState,
    pub class: ConnClass,
    events: Option<EventRing>,
}

impl SlotState {
    /// Pending events, created on first use.
    pub fn events(&mut self, capacity: usize) -> &mut EventRing {
        self.events.get_or_insert_with(|| EventRing::new(capacity))
    }

    fn reset_events(&mut self) {
        if let Some(events) = self.events.as_mut() {
            events.reset();
        }
    }
}

/// I/O half of a connection slot, held by the worker serving it
pub enum Socket {
    Closed,
    Listener(TcpListener),
    Stream { stream: TcpStream, buffer: Buffer },
}

impl Socket {
    pub fn stream(stream: TcpStream) -> Self {
        Socket::Stream {
            stream,
            buffer: Buffer::new(),
        }
    }

    fn source(&mut self) -> Option<&mut dyn Source> {
        match self {
            Socket::Closed => None,
            Socket::Listener(listener) => Some(listener),
            Socket::Stream { stream, .. } => Some(stream),
        }
    }
}

pub struct ConnectionSlot {
    pub state: HybridRwLock<SlotState>,
    pub io: HybridRwLock<Socket>,
}

/// Fixed pool of connection slots addressed by generation-tagged tokens.
///
/// A token is `(generation << 32) | index`; the generation moves every time
/// a slot is released so events for a closed connection never reach the
/// next one to use the slot.
pub struct ConnectionArena {
    slots: Box<[ConnectionSlot]>,
    free: SegQueue<usize>,
    ring_capacity: usize,
}

impl ConnectionArena {
    pub fn new(capacity: usize, ring_capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| ConnectionSlot {
                state: HybridRwLock::new(SlotState {
                    generation: 0,
                    state: ConnState::Free,
                    class: ConnClass::Message,
                    events: None,
                }),
                io: HybridRwLock::new(Socket::Closed),
            })
            .collect();

        let free = SegQueue::new();
        for index in (LISTENER + 1)..capacity {
            free.push(index);
        }

        Self {
            slots,
            free,
            ring_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    pub fn slot(&self, index: usize) -> &ConnectionSlot {
        &self.slots[index]
    }

    pub fn encode(index: usize, generation: u32) -> Token {
        Token((((generation as u64) << 32) | index as u64) as usize)
    }

    pub fn decode(token: usize) -> (usize, u32) {
        let raw = token as u64;
        ((raw & 0xffff_ffff) as usize, (raw >> 32) as u32)
    }

    /// Slot index and generation named by `token`, if the index is in range.
    pub fn resolve(&self, token: usize) -> Option<(usize, u32)> {
        let (index, generation) = Self::decode(token);
        (index < self.slots.len()).then_some((index, generation))
    }

    /// Reserve a free message slot.
    pub fn allocate(&self) -> Option<usize> {
        self.free.pop()
    }

    /// Put `socket` into slot `index` and mark it waiting.
    pub fn install(&self, index: usize, class: ConnClass, socket: Socket) -> Token {
        let slot = &self.slots[index];
        *slot.io.write() = socket;

        let mut state = slot.state.write();
        state.state = ConnState::Waiting;
        state.class = class;
        state.events(self.ring_capacity);

        trace!(
            "connection install: index = {} : gen = {} : class = {:?}",
            index,
            state.generation,
            class
        );

        Self::encode(index, state.generation)
    }

    pub fn register(&self, index: usize, token: Token, registry: &Registry) -> io::Result<()> {
        let mut io = self.slots[index].io.write();
        match io.source() {
            Some(source) => registry.register(source, token, Interest::READABLE),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Deregister and drop the socket, then return the slot to the pool.
    pub fn release(&self, index: usize, registry: &Registry) {
        let slot = &self.slots[index];

        {
            let mut io = slot.io.write();
            if let Some(source) = io.source() {
                if let Err(e) = registry.deregister(source) {
                    trace!("connection release: deregister {}: {}", index, e);
                }
            }
            *io = Socket::Closed;
        }

        {
            let mut state = slot.state.write();
            state.state = ConnState::Free;
            state.generation = state.generation.wrapping_add(1);
            state.reset_events();
        }

        if index != LISTENER {
            self.free.push(index);
        }
    }

    /// Slots currently handed out, listener excluded
    pub fn in_use(&self) -> usize {
        self.slots.len() - 1 - self.free.len()
    }
}
