//! A single-threaded evented reactor for non-blocking TCP and UNIX-domain
//! stream sockets.
//!
//! One loop thread owns every socket and every deferred task: readiness is
//! multiplexed through [`mio`], dispatched to user [`Handler`]s, and
//! interleaved with one-shot, periodic and per-tick tasks. Cross-thread
//! entry points (`stop`, the schedulers, `connect`/`listen`) hand their work
//! to the loop and wake it, so all user code runs serialized on the loop
//! thread.
//!
//! ```no_run
//! use gyre::Connection;
//! use gyre::Handler;
//! use gyre::Reactor;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_read(&mut self, _reactor: &Reactor, conn: &mut Connection, data: &[u8]) {
//!         conn.send_data(data);
//!     }
//! }
//!
//! let reactor = Reactor::default();
//! let handle = reactor.run_in_thread().unwrap();
//!
//! reactor.listen_tcp("127.0.0.1", 7000, || Echo).unwrap();
//!
//! reactor.stop();
//! handle.join().unwrap();
//! ```

mod connection;
mod error;
mod global;
mod queue;
mod reactor;
mod socket;
mod task;
mod transport;

pub use connection::Connection;
pub use connection::ConnectionId;
pub use connection::Handler;
pub use connection::Role;
pub use error::ConnectionError;
pub use error::Error;
pub use error::ReactorError;
pub use global::global;
pub use global::stop_global;
pub use queue::Queue;
pub use reactor::Reactor;
pub use reactor::DEFAULT_MAX_TICK_INTERVAL;
pub use transport::Stream;
pub use transport::Transport;
