//! Event distribution: one elected poller feeds a global queue, workers
//! fan events out to per-connection rings and serve whole connections.

mod connection;
mod engine;
mod event;
mod waiter;

pub use connection::{ConnClass, ConnState, ConnectionArena, Socket, LISTENER};
pub use engine::Engine;
pub use event::{EventRing, RawEvent};
pub use waiter::{Waiter, Worker};
