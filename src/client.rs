//! Outbound connection dialing.
//!
//! A [`Client`] owns a serial queue and dials connections on it; each dial
//! resolves, connects non-blocking (with an optional hard deadline) and
//! wraps the socket in a started [`Connection`]. Outcomes reach the
//! [`ClientDelegate`] on a designated queue — by default the client's own.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::config::Config;
use crate::connection::{Connection, ConnectionDelegate};
use crate::dispatch::{QueueHandle, SerialQueue};
use crate::error::{Error, Result};
use crate::logging::{LogLevel, Logger};
use crate::socket::{Family, Protocol, Socket};

/// Callbacks a client makes, on its designated callback queue.
pub trait ClientDelegate: Send + Sync {
    /// The dial succeeded and the connection is started.
    fn connected(&self, conn: &Arc<Connection>);
    /// A previously connected connection reached its end.
    fn disconnected(&self, conn: &Arc<Connection>);
    /// Bytes are waiting in the connection's rx buffer.
    fn has_data(&self, conn: &Arc<Connection>);
    /// The dial failed; a deadline expiry arrives as
    /// [`Error::TimedOut`].
    fn connection_failed(
        &self,
        host: &str,
        port: u16,
        family: Family,
        protocol: Protocol,
        error: Error,
    );
}

/// Dialer for outbound connections.
///
/// Owns the live-connection set; [`Client::disconnect_all`] tears every
/// member down from a single queue task, so no concurrent disconnect
/// callback can mutate the set underneath it.
pub struct Client {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    config: Config,
    logger: Logger,
    queue: SerialQueue,
    /// Where delegate callbacks are delivered; `None` means inline on the
    /// client's own queue
    callback_queue: Option<QueueHandle>,
    connections: Mutex<Vec<Arc<Connection>>>,
    delegate: Mutex<Option<Weak<dyn ClientDelegate>>>,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// Creates a client with explicit configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a client whose delegate callbacks are posted onto
    /// `callbacks` instead of running on the client's own queue.
    pub fn with_callback_queue(config: Config, callbacks: QueueHandle) -> Result<Self> {
        Self::build(config, Some(callbacks))
    }

    fn build(config: Config, callback_queue: Option<QueueHandle>) -> Result<Self> {
        let logger = config.build_logger();
        let queue = SerialQueue::new("ringsock-client")?;
        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                logger,
                queue,
                callback_queue,
                connections: Mutex::new(Vec::new()),
                delegate: Mutex::new(None),
            }),
        })
    }

    /// Attaches the delegate. Held weakly; the caller keeps it alive.
    pub fn set_delegate(&self, delegate: &Arc<dyn ClientDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(Arc::downgrade(delegate));
    }

    /// Dials `host:port` asynchronously.
    ///
    /// With a timeout, the connect is abandoned at the deadline and the
    /// delegate's `connection_failed` reports [`Error::TimedOut`];
    /// without one, an in-progress non-blocking connect is treated as
    /// connected and the readiness sources surface the outcome.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        family: Family,
        protocol: Protocol,
        timeout: Option<Duration>,
    ) {
        let weak = Arc::downgrade(&self.shared);
        let host = host.to_string();
        self.shared.queue.post(move || {
            if let Some(shared) = weak.upgrade() {
                ClientShared::dial(&shared, host, port, family, protocol, timeout);
            }
        });
    }

    /// Dials with a raw protocol number, rejecting anything but TCP and
    /// UDP with [`Error::ProtocolNotSupported`] before any work is
    /// scheduled.
    pub fn connect_raw(
        &self,
        host: &str,
        port: u16,
        family: Family,
        raw_protocol: i32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let protocol = Protocol::try_from(raw_protocol)?;
        self.connect(host, port, family, protocol, timeout);
        Ok(())
    }

    /// Disconnects every live connection from one queue task.
    pub fn disconnect_all(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.queue.post(move || {
            let Some(shared) = weak.upgrade() else { return };
            let connections: Vec<_> = shared.connections.lock().unwrap().clone();
            for conn in connections {
                conn.async_disconnect(None);
            }
        });
    }

    /// Snapshot of the live connections.
    pub fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.lock().unwrap().clone()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ClientShared {
    /// Delivers a delegate callback on the designated queue.
    fn deliver(&self, callback: impl FnOnce(Arc<dyn ClientDelegate>) + Send + 'static) {
        let Some(delegate) = self.delegate.lock().unwrap().as_ref().and_then(Weak::upgrade)
        else {
            return;
        };
        match &self.callback_queue {
            Some(handle) => {
                handle.post(move || callback(delegate));
            }
            None => callback(delegate),
        }
    }

    /// Runs one dial on the client's queue.
    fn dial(
        this: &Arc<Self>,
        host: String,
        port: u16,
        family: Family,
        protocol: Protocol,
        timeout: Option<Duration>,
    ) {
        let mut socket = Socket::new(family, protocol);
        let connected = match timeout {
            Some(timeout) => socket.connect_deadline(&host, port, timeout),
            None => socket.connect(&host, port, true),
        };
        if let Err(error) = connected {
            this.dial_failed(host, port, family, protocol, error);
            return;
        }

        match Connection::new(
            socket,
            host.clone(),
            &this.queue,
            &this.config,
            this.logger.clone(),
        ) {
            Ok(conn) => {
                let delegate: Arc<dyn ConnectionDelegate> = Arc::clone(this) as Arc<dyn ConnectionDelegate>;
                conn.set_delegate(Arc::downgrade(&delegate));
                this.connections.lock().unwrap().push(Arc::clone(&conn));
                this.logger.log(
                    LogLevel::Debug,
                    "client",
                    &format!("connected to {}:{} ({})", conn.host(), port, protocol),
                );
                let announced = Arc::clone(&conn);
                this.deliver(move |delegate| delegate.connected(&announced));
                conn.start();
            }
            Err(error) => this.dial_failed(host, port, family, protocol, error),
        }
    }

    fn dial_failed(
        &self,
        host: String,
        port: u16,
        family: Family,
        protocol: Protocol,
        error: Error,
    ) {
        self.logger.log(
            LogLevel::Debug,
            "client",
            &format!("dial {}:{} failed: {}", host, port, error),
        );
        self.deliver(move |delegate| {
            delegate.connection_failed(&host, port, family, protocol, error)
        });
    }
}

impl ConnectionDelegate for ClientShared {
    fn connection_has_data(&self, conn: &Arc<Connection>) {
        let conn = Arc::clone(conn);
        self.deliver(move |delegate| delegate.has_data(&conn));
    }

    fn connection_closed(&self, conn: &Arc<Connection>) {
        let announced = Arc::clone(conn);
        self.deliver(move |delegate| delegate.disconnected(&announced));
        let mut connections = self.connections.lock().unwrap();
        if let Some(pos) = connections.iter().position(|c| Arc::ptr_eq(c, conn)) {
            connections.remove(pos);
        }
    }
}
