//! relay: the core connection and HTTP/1.x processing engine of a
//! reverse proxy and load balancer.
//!
//! The crate is the per-session pipeline only: the connection state
//! machine with its three-layer polling intent, the incremental HTTP/1.x
//! head parser and chunked framing, the channel/buffer forward-only byte
//! discipline, the analyser pipeline (rules, header mangling, compression
//! and connection-mode negotiation), and the stream-interface layering by
//! which a scheduler drives a session. The poller, configuration parsing,
//! health checking, TLS internals and logging sinks are collaborators
//! behind small interfaces, not residents.
//!
//! A minimal embedding looks like:
//!
//! ```no_run
//! use std::rc::Rc;
//! use relay::connection::{Connection, NullPoller, Target, Xprt};
//! use relay::connection::transport::MemXprt;
//! use relay::proxy::{Proxy, PxMode};
//! use relay::session::{Session, SessionStatus};
//!
//! let fe = Rc::new(Proxy::new("www", PxMode::Http));
//! let (client, _peer) = MemXprt::pair();
//! let mut conn = Connection::new(Target::Proxy(fe.clone()));
//! conn.prepare(None, Xprt::Mem(client), None);
//!
//! let mut sess = Session::accept(fe, None, conn, 0);
//! let mut poller = NullPoller;
//! match sess.process(0, &mut poller) {
//!     SessionStatus::Running(deadline) => { /* re-arm the scheduler */ }
//!     SessionStatus::Closed => { /* release the session */ }
//! }
//! ```

#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]

pub mod analyser;
pub mod applet;
pub mod buffer;
pub mod channel;
pub mod clock;
pub mod compress;
pub mod connection;
pub mod error;
pub mod interface;
pub mod proto;
pub mod proxy;
pub mod session;
pub mod status;

pub use crate::error::{Error, Result};
pub use crate::session::{Session, SessionStatus};
