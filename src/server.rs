//! Multi-client TCP listener.
//!
//! A [`Server`] owns a listening socket, an accept-readiness source and a
//! serial queue labeled for it; every accepted [`Connection`] inherits the
//! queue and reports back through the [`ServerDelegate`]. A single accept
//! failure never takes the listener down — it is logged and the burst
//! continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::Config;
use crate::connection::{Connection, ConnectionDelegate};
use crate::dispatch::{EventSource, SerialQueue};
use crate::error::{Error, Result};
use crate::logging::{LogLevel, Logger};
use crate::socket::{Family, Protocol, Socket};

/// Callbacks a server makes, all on the server's serial queue.
pub trait ServerDelegate: Send + Sync {
    /// A connection was accepted and started.
    fn connected(&self, conn: &Arc<Connection>);
    /// A connection reached its end; it is still present in the server's
    /// set for the duration of this call, so context lookups resolve.
    fn disconnected(&self, conn: &Arc<Connection>);
    /// Bytes are waiting in the connection's rx buffer.
    fn has_data(&self, conn: &Arc<Connection>);
    /// The listener was torn down after `stop()`.
    fn stopped(&self);
}

/// Multi-client server listening on one port.
///
/// `start()` binds and listens synchronously, so configuration failures
/// surface to the caller as [`Error::ListenerStart`]; everything after
/// that is event-driven on the server's queue.
pub struct Server {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    port: u16,
    family: Family,
    config: Config,
    logger: Logger,
    queue: Mutex<Option<SerialQueue>>,
    listener: Mutex<Option<Socket>>,
    accept_source: Mutex<Option<EventSource>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    delegate: Mutex<Option<Weak<dyn ServerDelegate>>>,
    started: AtomicBool,
    bound_port: Mutex<Option<u16>>,
    user_object: Mutex<Option<String>>,
}

impl Server {
    /// Creates a server for `port`/`family` with default configuration.
    ///
    /// Port zero asks the OS for an ephemeral port; see
    /// [`Server::bound_port`].
    pub fn new(port: u16, family: Family) -> Self {
        Self::with_config(port, family, Config::default())
    }

    /// Creates a server with explicit configuration.
    pub fn with_config(port: u16, family: Family, config: Config) -> Self {
        let logger = config.build_logger();
        Self {
            shared: Arc::new(ServerShared {
                port,
                family,
                config,
                logger,
                queue: Mutex::new(None),
                listener: Mutex::new(None),
                accept_source: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
                delegate: Mutex::new(None),
                started: AtomicBool::new(false),
                bound_port: Mutex::new(None),
                user_object: Mutex::new(None),
            }),
        }
    }

    /// Attaches the delegate. Held weakly; the caller keeps it alive.
    pub fn set_delegate(&self, delegate: &Arc<dyn ServerDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(Arc::downgrade(delegate));
    }

    /// Binds, listens and begins accepting.
    ///
    /// Runs synchronously; a bind/listen/setup failure comes back as
    /// [`Error::ListenerStart`] wrapping the cause. Calling `start` on a
    /// server that is already started is a no-op.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let wrap = |e: Error| Error::ListenerStart(Box::new(e));

        let mut listener = Socket::new(shared.family, Protocol::Tcp);
        listener.bind(shared.port, None).map_err(wrap)?;
        listener.listen(shared.config.listener.backlog).map_err(wrap)?;
        let bound = listener.local_addr().map_err(wrap)?.port();

        let queue =
            SerialQueue::new(&format!("ringsock-server-{}", bound)).map_err(wrap)?;
        let source = listener.make_read_source(&queue).map_err(wrap)?;

        let weak = Arc::downgrade(shared);
        source.set_event_handler(move |pending| {
            if let Some(shared) = weak.upgrade() {
                ServerShared::handle_accept(&shared, pending);
            }
        });
        let weak = Arc::downgrade(shared);
        source.set_cancel_handler(move || {
            if let Some(shared) = weak.upgrade() {
                shared.accept_cancelled();
            }
        });

        shared.logger.log(
            LogLevel::Info,
            "server",
            &format!("listening on port {} ({})", bound, shared.family),
        );

        *shared.bound_port.lock().unwrap() = Some(bound);
        *shared.listener.lock().unwrap() = Some(listener);
        *shared.queue.lock().unwrap() = Some(queue);
        source.resume();
        *shared.accept_source.lock().unwrap() = Some(source);
        shared.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops accepting and disconnects every live connection.
    ///
    /// Asynchronous: the delegate's `stopped` callback marks the moment
    /// after which no further callbacks occur. Connection `disconnected`
    /// callbacks are ordered before `stopped`.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let handle = {
            let queue = shared.queue.lock().unwrap();
            queue.as_ref().map(|q| q.handle())
        };
        let Some(handle) = handle else { return };

        let weak = Arc::downgrade(shared);
        handle.post(move || {
            let Some(shared) = weak.upgrade() else { return };
            let connections: Vec<_> = shared.connections.lock().unwrap().clone();
            for conn in connections {
                conn.async_disconnect(None);
            }
            let source = shared.accept_source.lock().unwrap().take();
            if let Some(source) = source {
                source.cancel();
            }
        });
    }

    /// Requests an orderly disconnect of one connection.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        conn.disconnect();
    }

    /// Finds the live connection whose context tag equals `context`.
    pub fn connection_with_context(&self, context: &str) -> Option<Arc<Connection>> {
        self.shared
            .connections
            .lock()
            .unwrap()
            .iter()
            .find(|conn| conn.context().as_deref() == Some(context))
            .cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Whether the listener is up.
    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// The actual listening port (differs from the configured port when
    /// that was zero). `None` before the first successful `start()`.
    pub fn bound_port(&self) -> Option<u16> {
        *self.shared.bound_port.lock().unwrap()
    }

    /// The opaque user tag attached to this server.
    pub fn user_object(&self) -> Option<String> {
        self.shared.user_object.lock().unwrap().clone()
    }

    /// Sets the opaque user tag.
    pub fn set_user_object(&self, tag: &str) {
        *self.shared.user_object.lock().unwrap() = Some(tag.to_string());
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.shared.port)
            .field("family", &self.shared.family)
            .field("started", &self.started())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerShared {
    fn user_delegate(&self) -> Option<Arc<dyn ServerDelegate>> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Drains an accept burst: the source's data hint is the pending
    /// connection count, and each pending entry gets one non-blocking
    /// accept.
    fn handle_accept(self: &Arc<Self>, pending: u64) {
        let count = pending.max(1);
        for _ in 0..count {
            let accepted = {
                let mut listener = self.listener.lock().unwrap();
                match listener.as_mut() {
                    Some(listener) => listener.accept(true),
                    // Listener already cleared by stop().
                    None => return,
                }
            };
            match accepted {
                Ok(socket) => self.adopt(socket),
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // The kernel's pending count was stale; nothing left
                    // in this burst.
                    self.logger.log(
                        LogLevel::Debug,
                        "server",
                        "accept burst drained early (stale pending count)",
                    );
                }
                Err(error) => {
                    self.logger.log_error("server", &error, "accept failed");
                }
            }
        }
    }

    /// Wraps an accepted socket in a started connection.
    fn adopt(self: &Arc<Self>, socket: Socket) {
        let host = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let conn = {
            let queue = self.queue.lock().unwrap();
            let Some(queue) = queue.as_ref() else { return };
            Connection::new(socket, host, queue, &self.config, self.logger.clone())
        };

        match conn {
            Ok(conn) => {
                let delegate: Arc<dyn ConnectionDelegate> = Arc::clone(self) as Arc<dyn ConnectionDelegate>;
                conn.set_delegate(Arc::downgrade(&delegate));
                self.connections.lock().unwrap().push(Arc::clone(&conn));
                conn.start();
                self.logger.log(
                    LogLevel::Debug,
                    "server",
                    &format!("accepted connection from {}", conn.host()),
                );
                if let Some(delegate) = self.user_delegate() {
                    delegate.connected(&conn);
                }
            }
            Err(error) => {
                self.logger
                    .log_error("server", &error, "connection setup failed");
            }
        }
    }

    /// Runs on the queue when the accept source's cancellation completes.
    fn accept_cancelled(&self) {
        self.listener.lock().unwrap().take();
        self.logger
            .log(LogLevel::Info, "server", "listener stopped");
        if let Some(delegate) = self.user_delegate() {
            delegate.stopped();
        }
    }
}

impl ConnectionDelegate for ServerShared {
    fn connection_has_data(&self, conn: &Arc<Connection>) {
        if let Some(delegate) = self.user_delegate() {
            delegate.has_data(conn);
        }
    }

    fn connection_closed(&self, conn: &Arc<Connection>) {
        // Delegate first, removal second: user code can still find the
        // connection by context during the callback.
        if let Some(delegate) = self.user_delegate() {
            delegate.disconnected(conn);
        }
        let mut connections = self.connections.lock().unwrap();
        if let Some(pos) = connections.iter().position(|c| Arc::ptr_eq(c, conn)) {
            connections.remove(pos);
        }
    }
}
