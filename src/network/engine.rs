use super::connection::{ConnClass, ConnState, ConnectionArena, Socket, LISTENER};
use super::event::RawEvent;
use super::waiter::{Waiter, Worker};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::CommandExecutor;
use mio::net::{TcpListener, TcpStream};
use mio::Poll;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Multi-threaded event distributor.
///
/// Events flow poller -> global queue -> per-connection ring. A connection
/// is claimed by the worker that moves it from `Waiting` to `Running` and
/// stays with that worker until its ring is empty, so frames on one
/// connection are served strictly in order by one thread at a time.
pub struct Engine {
    arena: ConnectionArena,
    waiter: Waiter,
    executor: CommandExecutor,
    tcp_nodelay: bool,
}

impl Engine {
    pub fn new(
        config: &Config,
        listener: std::net::TcpListener,
        executor: CommandExecutor,
    ) -> Result<(Self, Vec<Worker>)> {
        listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let (waiter, workers) = Waiter::new(
            poll,
            config.event_queue_capacity,
            config.poll_batch,
            config.threads,
            Duration::from_millis(config.enqueue_retry_ms),
        )?;

        let arena = ConnectionArena::new(config.max_connections, config.connection_queue_capacity);
        let token = arena.install(
            LISTENER,
            ConnClass::Listener,
            Socket::Listener(TcpListener::from_std(listener)),
        );
        arena.register(LISTENER, token, waiter.registry())?;

        Ok((
            Self {
                arena,
                waiter,
                executor,
                tcp_nodelay: config.tcp_nodelay,
            },
            workers,
        ))
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Open client connections
    pub fn connections(&self) -> usize {
        self.arena.in_use()
    }

    /// Serve connections until the global queue has nothing claimable.
    pub fn thread_process(&self) {
        while let Some(index) = self.dequeue() {
            trace!("thread process: conn = {}", index);
            if let Err(e) = self.process(index) {
                debug!("connection {}: {}", index, e);
            }
        }
    }

    /// Park until the poller has queued events.
    pub fn thread_wait(&self, worker: &Worker) -> Result<()> {
        self.waiter.wait(worker)
    }

    /// Move global events onto their connections' rings and claim the first
    /// connection found waiting.
    fn dequeue(&self) -> Option<usize> {
        let mut queue = self.waiter.queue();

        while let Some(event) = queue.pop() {
            if let Some(index) = self.route(event) {
                return Some(index);
            }
        }

        None
    }

    fn route(&self, event: RawEvent) -> Option<usize> {
        let Some((index, generation)) = self.arena.resolve(event.token) else {
            warn!("discarding event for unknown token {:#x}", event.token);
            return None;
        };

        let mut slot = self.arena.slot(index).state.write();

        if slot.state == ConnState::Free || slot.generation != generation {
            debug!("discarding event for closed connection {}", index);
            return None;
        }

        if !slot.events(self.arena.ring_capacity()).push(event) {
            error!("discarding event for connection {}: ring full", index);
            return None;
        }

        if slot.state == ConnState::Waiting {
            slot.state = ConnState::Running;
            return Some(index);
        }

        trace!("connection {} busy, event queued", index);
        None
    }

    /// Drain the ring of a connection claimed by [`Engine::dequeue`].
    fn process(&self, index: usize) -> Result<()> {
        loop {
            let (event, class) = {
                let mut slot = self.arena.slot(index).state.write();

                if slot.state != ConnState::Running {
                    let state = slot.state;
                    drop(slot);

                    error!("wrong connection state: {} : {:?}", index, state);
                    if state != ConnState::Free {
                        self.close(index);
                    }
                    return Err(Error::InvalidState(format!(
                        "connection {} processed in state {:?}",
                        index, state
                    )));
                }

                let next = slot.events(self.arena.ring_capacity()).pop();
                match next {
                    Some(event) => (event, slot.class),
                    None => {
                        slot.state = ConnState::Waiting;
                        return Ok(());
                    }
                }
            };

            trace!("process: conn = {} : {:?} : {:?}", index, class, event);

            match class {
                ConnClass::Listener => {
                    if let Err(e) = self.accept() {
                        error!("accept failed: {}", e);
                    }
                }
                ConnClass::Message => {
                    let open = if event.readable {
                        match self.serve(index) {
                            Ok(open) => open,
                            Err(e) => {
                                debug!("connection {}: {}", index, e);
                                false
                            }
                        }
                    } else {
                        true
                    };

                    if !open || event.is_hangup() {
                        self.close(index);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read and answer everything the socket has buffered.
    ///
    /// Returns false once the peer has closed its side.
    fn serve(&self, index: usize) -> Result<bool> {
        let mut io = self.arena.slot(index).io.write();

        let Socket::Stream { stream, buffer } = &mut *io else {
            return Err(Error::InvalidState(format!(
                "connection {} has no stream",
                index
            )));
        };

        loop {
            buffer.clear();

            let n = match stream.read(buffer.spare_mut()) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            buffer.commit(n);

            trace!("serve: conn = {} : read {} bytes", index, n);

            while !buffer.is_empty() {
                if let Err(e) = self.executor.dispatch(buffer, stream) {
                    if e.is_fatal_io() {
                        return Err(e);
                    }
                    debug!("connection {}: dropping rest of read: {}", index, e);
                    buffer.discard();
                }
            }
        }
    }

    fn accept(&self) -> Result<()> {
        loop {
            let accepted = {
                let mut io = self.arena.slot(LISTENER).io.write();
                match &mut *io {
                    Socket::Listener(listener) => listener.accept(),
                    _ => return Err(Error::InvalidState("listener closed".to_string())),
                }
            };

            match accepted {
                Ok((stream, addr)) => self.attach(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn attach(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.tcp_nodelay) {
            warn!("set_nodelay failed for {}: {}", addr, e);
        }

        let Some(index) = self.arena.allocate() else {
            warn!("connection table full, dropping client {}", addr);
            return;
        };

        // waiting before registration so the first event finds the slot ready
        let token = self.arena.install(index, ConnClass::Message, Socket::stream(stream));

        if let Err(e) = self.arena.register(index, token, self.waiter.registry()) {
            error!("register failed for {}: {}", addr, e);
            self.arena.release(index, self.waiter.registry());
            return;
        }

        info!(
            "new client connected ({}, conn = {}, open = {})",
            addr,
            index,
            self.connections()
        );
    }

    fn close(&self, index: usize) {
        self.arena.release(index, self.waiter.registry());
        debug!("closed connection {} (open = {})", index, self.connections());
    }
}
