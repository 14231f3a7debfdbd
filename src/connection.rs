//! Connection state machine and user-facing read/write API.
//!
//! A [`Connection`] couples one non-blocking socket with two mirror-mapped
//! ring buffers and two readiness sources on its owner's serial queue.
//! Inbound bytes flow kernel → socket → rx buffer → delegate; outbound
//! bytes flow user → tx buffer → socket → kernel. All state mutation other
//! than tx-buffer writes happens on the queue, so handlers never race.
//!
//! # Lifecycle
//!
//! Created → Running → Closing → Closed. [`Connection::start`] resumes the
//! read source (the delegate is attached first so no event is lost);
//! disconnecting cancels both sources and the connection reaches Closed
//! when both cancel completions have run, which is the single point where
//! the socket descriptor is closed and the delegate learns the connection
//! is gone.

use std::sync::{Arc, Mutex, Weak};

use crate::buffer::RingBuffer;
use crate::config::Config;
use crate::dispatch::{EventSource, QueueHandle, SerialQueue};
use crate::error::{Error, Result};
use crate::logging::{LogLevel, Logger};
use crate::socket::Socket;

/// Internal delegate wired to the owning server or client.
///
/// Held weakly: ownership flows owner → connection only.
pub(crate) trait ConnectionDelegate: Send + Sync {
    /// Bytes arrived in the connection's rx buffer.
    fn connection_has_data(&self, conn: &Arc<Connection>);
    /// The connection reached Closed; the socket is already closed.
    fn connection_closed(&self, conn: &Arc<Connection>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Closing,
    Closed,
}

struct ConnState {
    phase: Phase,
    /// Readiness sources not yet cancel-completed; the socket closes when
    /// this reaches zero
    source_refcount: u8,
    /// Whether the write source is currently resumed; serializes
    /// resume/suspend so each resume pairs with exactly one suspend
    write_source_running: bool,
    error: Option<Arc<Error>>,
    context: Option<String>,
}

/// One live socket connection.
///
/// Constructed by a server's accept path or a client's dial path; user
/// code receives it as `Arc<Connection>` through delegate callbacks and
/// the owner's lookup API.
///
/// # Threading
///
/// [`Connection::write`] and friends may be called from any thread; they
/// only touch the tx buffer's producer side and post to the owner's
/// queue. The reading accessors ([`Connection::read_line`] etc.) consume
/// the rx buffer and belong in `has_data` callbacks, which run on the
/// owner's queue.
pub struct Connection {
    host: String,
    socket: Mutex<Socket>,
    rx: RingBuffer,
    tx: RingBuffer,
    read_source: EventSource,
    write_source: EventSource,
    queue: QueueHandle,
    /// Cached `SO_SNDBUF`; caps each drain iteration
    send_buffer_size: usize,
    state: Mutex<ConnState>,
    delegate: Mutex<Option<Weak<dyn ConnectionDelegate>>>,
    logger: Logger,
}

impl Connection {
    /// Wraps an already-connected non-blocking socket.
    ///
    /// Creates both buffers and both sources (suspended), and caches the
    /// kernel send-buffer size. Events do not flow until
    /// [`Connection::start`].
    pub(crate) fn new(
        socket: Socket,
        host: String,
        queue: &SerialQueue,
        config: &Config,
        logger: Logger,
    ) -> Result<Arc<Self>> {
        let send_buffer_size = socket.send_buffer_size()?;
        let read_source = socket.make_read_source(queue)?;
        let write_source = socket.make_write_source(queue)?;

        let conn = Arc::new(Self {
            host,
            socket: Mutex::new(socket),
            rx: RingBuffer::with_initial_size(config.buffer.rx_initial),
            tx: RingBuffer::with_initial_size(config.buffer.tx_initial),
            read_source,
            write_source,
            queue: queue.handle(),
            send_buffer_size,
            state: Mutex::new(ConnState {
                phase: Phase::Created,
                source_refcount: 2,
                write_source_running: false,
                error: None,
                context: None,
            }),
            delegate: Mutex::new(None),
            logger,
        });

        conn.install_handlers();
        Ok(conn)
    }

    fn install_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.read_source.set_event_handler(move |data| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_readable(data);
            }
        });

        let weak = Arc::downgrade(self);
        self.read_source.set_cancel_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.source_cancel_completed();
            }
        });

        let weak = Arc::downgrade(self);
        self.write_source.set_event_handler(move |_| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_writable();
            }
        });

        let weak = Arc::downgrade(self);
        self.write_source.set_cancel_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.source_cancel_completed();
            }
        });
    }

    pub(crate) fn set_delegate(&self, delegate: Weak<dyn ConnectionDelegate>) {
        *self.delegate.lock().unwrap() = Some(delegate);
    }

    /// Starts event delivery by resuming the read source.
    ///
    /// The owner attaches the delegate before calling this, so the first
    /// bytes cannot slip past an unattached delegate.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue.post(move || {
            if let Some(conn) = weak.upgrade() {
                conn.start_on_queue();
            }
        });
    }

    fn start_on_queue(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Created {
                return;
            }
            state.phase = Phase::Running;
        }
        self.read_source.resume();
    }

    /// The remote host label this connection was created with.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The user-assigned context tag, if any.
    pub fn context(&self) -> Option<String> {
        self.state.lock().unwrap().context.clone()
    }

    /// Sets the user-assigned context tag.
    pub fn set_context(&self, context: &str) {
        self.state.lock().unwrap().context = Some(context.to_string());
    }

    /// The fatal error that closed (or is closing) the connection, if
    /// any.
    pub fn last_error(&self) -> Option<Arc<Error>> {
        self.state.lock().unwrap().error.clone()
    }

    /// Number of bytes waiting in the rx buffer.
    pub fn buffered(&self) -> usize {
        self.rx.available()
    }

    // ---- outbound path (any thread) ----

    /// Queues `data` for sending.
    ///
    /// Copies into the tx buffer and nudges the owner's queue to resume
    /// the write source. Fails fast with [`Error::WriteBufferFull`] when
    /// the buffer cannot take the bytes — backpressure the caller should
    /// retry after the connection drains.
    pub fn write(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let span = self.tx.acquire_write(data.len())?;
        span[..data.len()].copy_from_slice(data);
        self.tx.commit_write(data.len());
        self.schedule_write_resume();
        Ok(())
    }

    /// Queues a string for sending.
    pub fn write_str(self: &Arc<Self>, s: &str) -> Result<()> {
        self.write(s.as_bytes())
    }

    /// Queues `s` followed by CRLF, as a single all-or-nothing write.
    pub fn write_line(self: &Arc<Self>, s: &str) -> Result<()> {
        let total = s.len() + 2;
        let span = self.tx.acquire_write(total)?;
        span[..s.len()].copy_from_slice(s.as_bytes());
        span[s.len()..total].copy_from_slice(b"\r\n");
        self.tx.commit_write(total);
        self.schedule_write_resume();
        Ok(())
    }

    /// Splices everything buffered on `other`'s inbound side into this
    /// connection's outbound side — one copy, no intermediate buffer.
    ///
    /// Supports proxy-style relays; call during `other`'s `has_data`
    /// callback.
    pub fn copy_all_from(self: &Arc<Self>, other: &Arc<Connection>) -> Result<usize> {
        let moved = self.tx.splice_from(&other.rx)?;
        if moved > 0 {
            self.schedule_write_resume();
        }
        Ok(moved)
    }

    fn schedule_write_resume(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue.post(move || {
            if let Some(conn) = weak.upgrade() {
                conn.resume_write_on_queue();
            }
        });
    }

    fn resume_write_on_queue(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Running || state.write_source_running {
            return;
        }
        if self.tx.available() == 0 {
            // Already drained by the time the nudge arrived.
            return;
        }
        state.write_source_running = true;
        drop(state);
        self.write_source.resume();
    }

    // ---- inbound accessors (owner's queue, during has_data) ----

    /// Consumes up to and including the first LF, returning the line
    /// without its terminator (a trailing CR is stripped).
    ///
    /// Returns `Ok(None)` while no complete line is buffered, and
    /// [`Error::NotUtf8`] when the consumed bytes do not decode.
    pub fn read_line(&self) -> Result<Option<String>> {
        let span = self.rx.acquire_read();
        let Some(lf) = span.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line = &span[..lf];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let text = std::str::from_utf8(line).map_err(|_| Error::NotUtf8)?.to_string();
        self.rx.commit_read(lf + 1);
        Ok(Some(text))
    }

    /// Consumes up through the first `separator` byte plus any run of
    /// separators immediately following it, returning the token before
    /// the separator.
    ///
    /// Returns `Ok(None)` while no separator is buffered.
    pub fn read_token(&self, separator: u8) -> Result<Option<String>> {
        let span = self.rx.acquire_read();
        let Some(sep) = span.iter().position(|b| *b == separator) else {
            return Ok(None);
        };
        let mut end = sep + 1;
        while end < span.len() && span[end] == separator {
            end += 1;
        }
        let text = std::str::from_utf8(&span[..sep])
            .map_err(|_| Error::NotUtf8)?
            .to_string();
        self.rx.commit_read(end);
        Ok(Some(text))
    }

    /// Returns the first `n` buffered bytes as a string without
    /// consuming them; `Ok(None)` when fewer than `n` are buffered.
    pub fn peek(&self, n: usize) -> Result<Option<String>> {
        let span = self.rx.acquire_read();
        if span.len() < n {
            return Ok(None);
        }
        let text = std::str::from_utf8(&span[..n])
            .map_err(|_| Error::NotUtf8)?
            .to_string();
        Ok(Some(text))
    }

    /// Consumes and returns up to `n` bytes — never more than buffered,
    /// possibly empty.
    pub fn read(&self, n: usize) -> Vec<u8> {
        let span = self.rx.acquire_read();
        let take = span.len().min(n);
        let out = span[..take].to_vec();
        self.rx.commit_read(take);
        out
    }

    /// Drains and returns everything buffered.
    pub fn read_all_data(&self) -> Vec<u8> {
        let span = self.rx.acquire_read();
        let out = span.to_vec();
        self.rx.commit_read(out.len());
        out
    }

    // ---- disconnect path ----

    /// Requests an orderly disconnect.
    pub fn disconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue.post(move || {
            if let Some(conn) = weak.upgrade() {
                conn.async_disconnect(None);
            }
        });
    }

    /// Tears the connection down on the owner's queue. Idempotent.
    ///
    /// Records the first fatal error, resumes the write source if it was
    /// suspended (cancellation delivery requires a non-suspended source),
    /// and cancels both sources. The Closed transition happens in the
    /// cancel completions.
    pub(crate) fn async_disconnect(self: &Arc<Self>, error: Option<Error>) {
        let resume_read;
        let resume_write;
        {
            let mut state = self.state.lock().unwrap();
            if state.phase == Phase::Closing || state.phase == Phase::Closed {
                return;
            }
            // A never-started connection still holds its read source
            // suspended; the cancellation has to travel through a resume.
            resume_read = state.phase == Phase::Created;
            state.phase = Phase::Closing;
            if let Some(error) = error {
                if state.error.is_none() {
                    if self.logger.enabled(LogLevel::Debug) {
                        self.logger.log(
                            LogLevel::Debug,
                            "connection",
                            &format!("{}: disconnecting: {}", self.host, error),
                        );
                    }
                    state.error = Some(Arc::new(error));
                }
            }
            resume_write = !state.write_source_running;
            if resume_write {
                state.write_source_running = true;
            }
        }

        if resume_read {
            self.read_source.resume();
        }
        if resume_write {
            self.write_source.resume();
        }
        self.read_source.cancel();
        self.write_source.cancel();
    }

    /// Runs once per source when its cancellation completes; the second
    /// run closes the socket and notifies the delegate.
    fn source_cancel_completed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.source_refcount = state.source_refcount.saturating_sub(1);
            if state.source_refcount > 0 {
                return;
            }
            state.phase = Phase::Closed;
        }
        self.socket.lock().unwrap().close();
        let delegate = self.current_delegate();
        if let Some(delegate) = delegate {
            delegate.connection_closed(self);
        }
    }

    // ---- source handlers (owner's queue) ----

    fn current_delegate(&self) -> Option<Arc<dyn ConnectionDelegate>> {
        self.delegate
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn handle_readable(self: &Arc<Self>, hint: u64) {
        if self.state.lock().unwrap().phase != Phase::Running {
            return;
        }
        if hint == 0 {
            // A readable wakeup with nothing to read is the peer's
            // shutdown.
            self.async_disconnect(Some(Error::ConnectionReset));
            return;
        }

        let span = match self.rx.acquire_write(hint as usize) {
            Ok(span) => span,
            Err(_) => {
                // The consumer did not drain; refusing to grow unbounded
                // turns the stall into a disconnect.
                self.async_disconnect(Some(Error::ConnectionReset));
                return;
            }
        };

        let got = {
            let mut socket = self.socket.lock().unwrap();
            match socket.read(span) {
                Ok(got) => got,
                Err(error) => {
                    drop(socket);
                    self.async_disconnect(Some(error));
                    return;
                }
            }
        };
        if got == 0 {
            return;
        }
        self.rx.commit_write(got);

        if let Some(delegate) = self.current_delegate() {
            delegate.connection_has_data(self);
        }
    }

    fn handle_writable(self: &Arc<Self>) {
        if self.state.lock().unwrap().phase != Phase::Running {
            return;
        }
        loop {
            let n = self.tx.available().min(self.send_buffer_size);
            if n == 0 {
                // Drained: park the source until the next user write.
                let mut state = self.state.lock().unwrap();
                if state.write_source_running {
                    state.write_source_running = false;
                    drop(state);
                    self.write_source.suspend();
                }
                return;
            }

            let span = self.tx.acquire_read();
            let written = {
                let mut socket = self.socket.lock().unwrap();
                match socket.write(&span[..n]) {
                    Ok(written) => written,
                    Err(error) => {
                        drop(socket);
                        self.async_disconnect(Some(error));
                        return;
                    }
                }
            };
            if written == 0 {
                // Kernel buffer full again; stay armed and wait.
                return;
            }
            self.tx.commit_read(written);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("phase", &state.phase)
            .field("buffered", &self.rx.available())
            .field("pending_out", &self.tx.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{Family, Protocol};
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    struct TestDelegate {
        data: mpsc::Sender<usize>,
        closed: mpsc::Sender<Option<Arc<Error>>>,
    }

    impl ConnectionDelegate for TestDelegate {
        fn connection_has_data(&self, conn: &Arc<Connection>) {
            let _ = self.data.send(conn.buffered());
        }

        fn connection_closed(&self, conn: &Arc<Connection>) {
            let _ = self.closed.send(conn.last_error());
        }
    }

    struct Harness {
        queue: SerialQueue,
        conn: Arc<Connection>,
        peer: TcpStream,
        delegate: Arc<TestDelegate>,
        data_rx: mpsc::Receiver<usize>,
        closed_rx: mpsc::Receiver<Option<Arc<Error>>>,
    }

    fn harness(config: &Config) -> Harness {
        let queue = SerialQueue::new("conn-test").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut socket = Socket::new(Family::Ipv4, Protocol::Tcp);
        socket.connect("127.0.0.1", port, true).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let conn = Connection::new(
            socket,
            "127.0.0.1".to_string(),
            &queue,
            config,
            Logger::disabled(),
        )
        .unwrap();

        let (data_tx, data_rx) = mpsc::channel();
        let (closed_tx, closed_rx) = mpsc::channel();
        let delegate = Arc::new(TestDelegate {
            data: data_tx,
            closed: closed_tx,
        });
        let dyn_delegate: Arc<dyn ConnectionDelegate> =
            Arc::clone(&delegate) as Arc<dyn ConnectionDelegate>;
        let weak: Weak<dyn ConnectionDelegate> = Arc::downgrade(&dyn_delegate);
        conn.set_delegate(weak);
        conn.start();

        Harness {
            queue,
            conn,
            peer,
            delegate,
            data_rx,
            closed_rx,
        }
    }

    fn wait_buffered(h: &Harness, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.conn.buffered() < at_least {
            assert!(Instant::now() < deadline, "timed out waiting for bytes");
            let _ = h.data_rx.recv_timeout(Duration::from_millis(50));
        }
    }

    #[test]
    fn inbound_bytes_reach_the_delegate() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"hello").unwrap();
        wait_buffered(&h, 5);
        assert_eq!(h.conn.read_all_data(), b"hello");
    }

    #[test]
    fn outbound_bytes_reach_the_peer() {
        let mut h = harness(&Config::default());
        h.conn.write(b"outbound").unwrap();

        let mut buf = [0u8; 8];
        h.peer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        h.peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"outbound");
    }

    #[test]
    fn write_line_appends_crlf() {
        let mut h = harness(&Config::default());
        h.conn.write_line("ping").unwrap();

        let mut buf = [0u8; 6];
        h.peer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        h.peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\r\n");
    }

    #[test]
    fn read_line_strips_terminators() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"first\r\nsecond\npartial").unwrap();
        wait_buffered(&h, 21);

        assert_eq!(h.conn.read_line().unwrap().as_deref(), Some("first"));
        assert_eq!(h.conn.read_line().unwrap().as_deref(), Some("second"));
        assert_eq!(h.conn.read_line().unwrap(), None);
        // The partial tail stays buffered.
        assert_eq!(h.conn.buffered(), 7);
    }

    #[test]
    fn read_line_rejects_invalid_utf8() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"\xff\xfe\n").unwrap();
        wait_buffered(&h, 3);

        match h.conn.read_line() {
            Err(Error::NotUtf8) => {}
            other => panic!("expected NotUtf8, got {:?}", other),
        }
    }

    #[test]
    fn read_token_coalesces_separator_runs() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"one   two x").unwrap();
        wait_buffered(&h, 11);

        assert_eq!(h.conn.read_token(b' ').unwrap().as_deref(), Some("one"));
        assert_eq!(h.conn.read_token(b' ').unwrap().as_deref(), Some("two"));
        assert_eq!(h.conn.read_token(b' ').unwrap(), None);
        assert_eq!(h.conn.read_all_data(), b"x");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"peekable").unwrap();
        wait_buffered(&h, 8);

        assert_eq!(h.conn.peek(4).unwrap().as_deref(), Some("peek"));
        assert_eq!(h.conn.peek(9).unwrap(), None);
        assert_eq!(h.conn.buffered(), 8);
        assert_eq!(h.conn.read(4), b"peek");
        assert_eq!(h.conn.read(100), b"able");
        assert!(h.conn.read(1).is_empty());
    }

    #[test]
    fn backpressure_then_drain_then_retry() {
        let config = Config::small_buffers(1);
        let mut h = harness(&config);

        // Keep writing until the tx buffer (bounded by the kernel's
        // unread send queue) pushes back.
        h.conn.write(b"x").unwrap();
        let capacity = h.conn.tx.capacity();
        let chunk = vec![b'z'; capacity / 2];
        let mut accepted = 1usize;
        loop {
            match h.conn.write(&chunk) {
                Ok(()) => {
                    accepted += chunk.len();
                    assert!(accepted < 256 * 1024 * 1024, "backpressure never appeared");
                }
                Err(Error::WriteBufferFull) => break,
                Err(other) => panic!("unexpected write error: {}", other),
            }
        }

        // Drain everything the connection accepted, then retry.
        h.peer
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut sink = vec![0u8; 64 * 1024];
        let mut drained = 0usize;
        while drained < accepted {
            drained += h.peer.read(&mut sink).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match h.conn.write(b"retry") {
                Ok(()) => break,
                Err(Error::WriteBufferFull) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("retry failed: {:?}", other),
            }
        }
        let mut tail = [0u8; 5];
        h.peer.read_exact(&mut tail).unwrap();
        assert_eq!(&tail, b"retry");
    }

    #[test]
    fn peer_close_surfaces_reset_after_all_bytes() {
        let mut h = harness(&Config::default());
        h.peer.write_all(b"final words").unwrap();
        drop(h.peer);

        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let error = loop {
            if let Ok(error) = h.closed_rx.recv_timeout(Duration::from_millis(50)) {
                collected.extend_from_slice(&h.conn.read_all_data());
                break error;
            }
            collected.extend_from_slice(&h.conn.read_all_data());
            assert!(Instant::now() < deadline, "no disconnect observed");
        };

        assert_eq!(collected, b"final words");
        match error.as_deref() {
            Some(Error::ConnectionReset) => {}
            other => panic!("expected ConnectionReset, got {:?}", other),
        }
        // keep the delegate alive until the end of the scenario
        drop(h.delegate);
    }

    #[test]
    fn disconnect_fires_closed_exactly_once() {
        let h = harness(&Config::default());
        h.conn.disconnect();
        h.conn.disconnect();

        h.closed_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(h
            .closed_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err());
        drop(h.delegate);
        drop(h.queue);
    }

    #[test]
    fn context_round_trips() {
        let h = harness(&Config::default());
        assert_eq!(h.conn.context(), None);
        h.conn.set_context("session-42");
        assert_eq!(h.conn.context().as_deref(), Some("session-42"));
        assert_eq!(h.conn.host(), "127.0.0.1");
    }

    #[test]
    fn relay_splices_between_connections() {
        let mut upstream = harness(&Config::default());
        let downstream = harness(&Config::default());

        upstream.peer.write_all(b"relayed payload").unwrap();
        wait_buffered(&upstream, 15);

        let moved = downstream.conn.copy_all_from(&upstream.conn).unwrap();
        assert_eq!(moved, 15);
        assert_eq!(upstream.conn.buffered(), 0);

        let mut buf = [0u8; 15];
        let mut peer = downstream.peer.try_clone().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"relayed payload");
    }
}
