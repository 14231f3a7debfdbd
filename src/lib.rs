//! # ringsock: event-driven TCP sockets with mirror-mapped ring buffers
//!
//! An event-driven socket library for client-initiated connections and
//! multi-client server listeners. Every connection pairs a non-blocking
//! socket with two independent readiness sources (read and write) on a
//! serial dispatch queue, and buffers each direction in a ring whose
//! readable region is always one contiguous linear span — a virtual
//! memory mirror maps the buffer's pages twice, back to back, so wrap
//! boundaries disappear and protocol parsers get flat memory with no
//! copies.
//!
//! ## Key Pieces
//!
//! - **[`RingBuffer`]**: contiguous-view SPSC byte queue with lazy VM
//!   allocation and in-place growth while empty
//! - **[`Socket`]**: thin typed wrapper over a non-blocking descriptor
//! - **[`Connection`]**: the state machine gluing a socket, two buffers
//!   and two readiness sources together, with line/token readers on top
//! - **[`Server`]**: accepts bursts of connections and owns the live set
//! - **[`Client`]**: dials with an optional hard deadline
//!
//! ## Echo Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ringsock::{Connection, Family, Server, ServerDelegate};
//!
//! struct Echo;
//!
//! impl ServerDelegate for Echo {
//!     fn connected(&self, conn: &Arc<Connection>) {
//!         println!("client {} connected", conn.host());
//!     }
//!     fn disconnected(&self, conn: &Arc<Connection>) {
//!         println!("client {} left", conn.host());
//!     }
//!     fn has_data(&self, conn: &Arc<Connection>) {
//!         while let Ok(Some(line)) = conn.read_line() {
//!             let _ = conn.write_line(&line);
//!         }
//!     }
//!     fn stopped(&self) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(7777, Family::Ipv4);
//! let delegate: Arc<dyn ServerDelegate> = Arc::new(Echo);
//! server.set_delegate(&delegate);
//! server.start()?;
//! // ... run until shutdown ...
//! server.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Dialing Out
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ringsock::{Client, ClientDelegate, Connection, Error, Family, Protocol};
//!
//! struct Greeter;
//!
//! impl ClientDelegate for Greeter {
//!     fn connected(&self, conn: &Arc<Connection>) {
//!         let _ = conn.write_line("HELO");
//!     }
//!     fn disconnected(&self, _conn: &Arc<Connection>) {}
//!     fn has_data(&self, conn: &Arc<Connection>) {
//!         if let Ok(Some(reply)) = conn.read_line() {
//!             println!("< {}", reply);
//!         }
//!     }
//!     fn connection_failed(
//!         &self,
//!         host: &str,
//!         port: u16,
//!         _family: Family,
//!         _protocol: Protocol,
//!         error: Error,
//!     ) {
//!         eprintln!("dial {}:{} failed: {}", host, port, error);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new()?;
//! let delegate: Arc<dyn ClientDelegate> = Arc::new(Greeter);
//! client.set_delegate(&delegate);
//! client.connect("example.com", 2525, Family::Ipv4, Protocol::Tcp,
//!                Some(Duration::from_millis(500)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading Model
//!
//! Each server and client owns one serial queue; every readiness event,
//! delegate callback (client callbacks can be redirected) and
//! connection-set mutation for that owner runs there, in FIFO order.
//! [`Connection::write`] is the one entry point designed for any thread:
//! it touches only the tx ring's producer side and posts a wakeup.
//!
//! ## Backpressure
//!
//! A tx ring never grows while non-empty. When a write does not fit,
//! [`Connection::write`] fails fast with [`Error::WriteBufferFull`]; retry
//! after the connection has drained. The rx ring applies the same rule to
//! a delegate that stops draining: the connection is dropped rather than
//! buffering without bound.
//!
//! ## Platform Support
//!
//! Linux is the supported host (mirror mappings are built on
//! `memfd_create`; readiness plumbing on epoll). Other POSIX hosts fail
//! buffer allocation with an unsupported-operation error.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]

// Core modules - the three tightly coupled subsystems
pub mod buffer;
pub mod connection;
pub mod dispatch; // Serial queues and readiness sources
pub mod error;
pub mod socket;

// Control path - acceptor and dialer
pub mod client;
pub mod server;

// Ambient concerns
pub mod config;
pub mod logging;

// Re-exports for convenience - commonly used types at crate root
pub use buffer::RingBuffer;
pub use client::{Client, ClientDelegate};
pub use config::{BufferConfig, Config, ListenerConfig, LoggingConfig};
pub use connection::Connection;
pub use dispatch::{EventSource, Interest, QueueHandle, SerialQueue};
pub use error::{Error, Result};
pub use logging::{ConsoleOutput, FileOutput, LogEntry, LogLevel, LogOutput, Logger};
pub use server::{Server, ServerDelegate};
pub use socket::{Family, Protocol, Socket};
