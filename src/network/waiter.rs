use super::event::{EventRing, RawEvent};
use crate::error::{Error, Result};
use crate::sync::{HybridRwLock, WriteGuard};
use crossbeam_channel::{bounded, Receiver, Sender};
use mio::{Events, Poll, Registry};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Identity of one worker thread inside the waiter
pub struct Worker {
    index: usize,
    wake: Receiver<()>,
}

impl Worker {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Default)]
struct Parked {
    order: VecDeque<usize>,
    elected: Option<usize>,
}

/// Shared polling facility.
///
/// Workers with nothing to do park here. The first one in becomes the
/// elected poller and blocks in the kernel wait; everybody else blocks on
/// a private wake channel until the poller has queued new events.
pub struct Waiter {
    poll: HybridRwLock<(Poll, Events)>,
    registry: Registry,
    generation: AtomicU64,
    parked: HybridRwLock<Parked>,
    queue: HybridRwLock<EventRing>,
    notifiers: Vec<Sender<()>>,
    poll_batch: usize,
    enqueue_retry: Duration,
}

impl Waiter {
    /// Waiter for `workers` threads plus their identities.
    pub fn new(
        poll: Poll,
        queue_capacity: usize,
        poll_batch: usize,
        workers: usize,
        enqueue_retry: Duration,
    ) -> Result<(Self, Vec<Worker>)> {
        if poll_batch == 0 || poll_batch >= queue_capacity {
            return Err(Error::InvalidArgument(
                "poll batch must be smaller than the event queue",
            ));
        }

        let registry = poll.registry().try_clone()?;

        let (notifiers, workers): (Vec<_>, Vec<_>) = (0..workers)
            .map(|index| {
                let (tx, rx) = bounded(1);
                (tx, Worker { index, wake: rx })
            })
            .unzip();

        let waiter = Self {
            poll: HybridRwLock::new((poll, Events::with_capacity(poll_batch))),
            registry,
            generation: AtomicU64::new(0),
            parked: HybridRwLock::new(Parked::default()),
            queue: HybridRwLock::new(EventRing::new(queue_capacity)),
            notifiers,
            poll_batch,
            enqueue_retry,
        };

        Ok((waiter, workers))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Completed poll rounds
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Exclusive access to the global event queue
    #[track_caller]
    pub fn queue(&self) -> WriteGuard<'_, EventRing> {
        self.queue.write()
    }

    /// Park `worker` until there may be work.
    ///
    /// Returns once the elected poller queued events, or after this worker
    /// did the polling itself.
    pub fn wait(&self, worker: &Worker) -> Result<()> {
        let elected = {
            let mut parked = self.parked.write();
            parked.order.push_back(worker.index);

            trace!("waiter: parked = {}", parked.order.len());

            if parked.elected.is_none() {
                parked.elected = Some(worker.index);
                true
            } else {
                false
            }
        };

        let result = if elected {
            trace!("waiter: worker {} polling", worker.index);
            self.poll_and_fan_out(worker.index)
        } else {
            worker
                .wake
                .recv()
                .map_err(|_| Error::InvalidState("waiter dropped".to_string()))
        };

        let mut parked = self.parked.write();
        parked.order.retain(|index| *index != worker.index);
        if parked.elected == Some(worker.index) {
            parked.elected = None;
        }

        result
    }

    fn poll_and_fan_out(&self, me: usize) -> Result<()> {
        let mut batch = Vec::with_capacity(self.poll_batch);

        {
            let mut guard = self.poll.write();
            let (poll, events) = &mut *guard;

            loop {
                match poll.poll(events, None) {
                    Ok(()) => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("poll exited with error: {}", e);
                        return Err(e.into());
                    }
                }
            }

            batch.extend(events.iter().map(RawEvent::from));
        }

        self.generation.fetch_add(1, Ordering::Relaxed);
        trace!("poll returned {} events", batch.len());

        if batch.is_empty() {
            return Ok(());
        }

        loop {
            {
                let mut queue = self.queue.write();

                if queue.extend(&batch) {
                    let parked = self.parked.read();
                    let mut woken = 0;

                    for index in parked.order.iter().filter(|index| **index != me) {
                        if woken == batch.len() {
                            break;
                        }
                        // a full channel already holds a pending wake
                        let _ = self.notifiers[*index].try_send(());
                        woken += 1;
                    }

                    trace!("waiter: queued {} events, woke {}", batch.len(), woken);
                    return Ok(());
                }
            }

            debug!("event queue full, retrying in {:?}", self.enqueue_retry);
            thread::sleep(self.enqueue_retry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::{Interest, Token};
    use std::net::TcpStream;
    use std::sync::Arc;

    #[test]
    fn test_rejects_batch_not_below_capacity() {
        let poll = Poll::new().unwrap();
        assert!(Waiter::new(poll, 8, 8, 1, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_elected_poller_wakes_parked_worker() {
        let poll = Poll::new().unwrap();
        let (waiter, mut workers) = Waiter::new(poll, 16, 8, 2, Duration::from_millis(1)).unwrap();
        let waiter = Arc::new(waiter);

        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        waiter
            .registry()
            .register(&mut listener, Token(7), Interest::READABLE)
            .unwrap();

        let idle = workers.pop().unwrap();
        let elected = workers.pop().unwrap();

        let poller = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || waiter.wait(&elected))
        };
        while waiter.parked.read().elected.is_none() {
            thread::yield_now();
        }

        let parked = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || waiter.wait(&idle))
        };
        while waiter.parked.read().order.len() < 2 {
            thread::yield_now();
        }
        assert_eq!(waiter.parked.read().elected, Some(0));

        let _client = TcpStream::connect(addr).unwrap();

        poller.join().unwrap().unwrap();
        parked.join().unwrap().unwrap();

        let event = waiter.queue().pop().unwrap();
        assert_eq!(event.token, 7);
        assert!(event.readable);
        assert!(waiter.generation() >= 1);
        assert!(waiter.parked.read().order.is_empty());
    }
}
