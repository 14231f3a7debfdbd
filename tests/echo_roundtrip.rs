//! Loopback integration tests: a server and a client in one process,
//! exchanging lines end to end.

use std::io::Write as _;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ringsock::{
    Client, ClientDelegate, Config, Connection, Error, Family, Protocol, Server, ServerDelegate,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Server delegate that echoes each received line back.
struct EchoServer {
    events: Mutex<mpsc::Sender<ServerEvent>>,
}

#[derive(Debug)]
enum ServerEvent {
    Connected(String),
    Disconnected(Option<Arc<Error>>, Vec<u8>),
    Stopped,
}

impl ServerDelegate for EchoServer {
    fn connected(&self, conn: &Arc<Connection>) {
        conn.set_context("echo-peer");
        let _ = self
            .events
            .lock()
            .unwrap()
            .send(ServerEvent::Connected(conn.host().to_string()));
    }

    fn disconnected(&self, conn: &Arc<Connection>) {
        let leftover = conn.read_all_data();
        let _ = self
            .events
            .lock()
            .unwrap()
            .send(ServerEvent::Disconnected(conn.last_error(), leftover));
    }

    fn has_data(&self, conn: &Arc<Connection>) {
        while let Ok(Some(line)) = conn.read_line() {
            conn.write_line(&line).unwrap();
        }
    }

    fn stopped(&self) {
        let _ = self.events.lock().unwrap().send(ServerEvent::Stopped);
    }
}

/// Client delegate that reports everything over channels.
struct RecordingClient {
    connected: Mutex<mpsc::Sender<Arc<Connection>>>,
    lines: Mutex<mpsc::Sender<String>>,
    disconnected: Mutex<mpsc::Sender<Option<Arc<Error>>>>,
    failures: Mutex<mpsc::Sender<Error>>,
}

impl ClientDelegate for RecordingClient {
    fn connected(&self, conn: &Arc<Connection>) {
        let _ = self.connected.lock().unwrap().send(Arc::clone(conn));
    }

    fn disconnected(&self, conn: &Arc<Connection>) {
        let _ = self
            .disconnected
            .lock()
            .unwrap()
            .send(conn.last_error());
    }

    fn has_data(&self, conn: &Arc<Connection>) {
        while let Ok(Some(line)) = conn.read_line() {
            let _ = self.lines.lock().unwrap().send(line);
        }
    }

    fn connection_failed(
        &self,
        _host: &str,
        _port: u16,
        _family: Family,
        _protocol: Protocol,
        error: Error,
    ) {
        let _ = self.failures.lock().unwrap().send(error);
    }
}

struct Rig {
    server: Server,
    server_events: mpsc::Receiver<ServerEvent>,
    _server_delegate: Arc<dyn ServerDelegate>,
    client: Client,
    client_delegate: Arc<dyn ClientDelegate>,
    connected: mpsc::Receiver<Arc<Connection>>,
    lines: mpsc::Receiver<String>,
    disconnected: mpsc::Receiver<Option<Arc<Error>>>,
    failures: mpsc::Receiver<Error>,
}

fn rig() -> Rig {
    let (events_tx, server_events) = mpsc::channel();
    let server = Server::new(0, Family::Ipv4);
    let server_delegate: Arc<dyn ServerDelegate> = Arc::new(EchoServer {
        events: Mutex::new(events_tx),
    });
    server.set_delegate(&server_delegate);
    server.start().unwrap();

    let (conn_tx, connected) = mpsc::channel();
    let (line_tx, lines) = mpsc::channel();
    let (disc_tx, disconnected) = mpsc::channel();
    let (fail_tx, failures) = mpsc::channel();
    let client = Client::with_config(Config::default()).unwrap();
    let client_delegate: Arc<dyn ClientDelegate> = Arc::new(RecordingClient {
        connected: Mutex::new(conn_tx),
        lines: Mutex::new(line_tx),
        disconnected: Mutex::new(disc_tx),
        failures: Mutex::new(fail_tx),
    });
    client.set_delegate(&client_delegate);

    Rig {
        server,
        server_events,
        _server_delegate: server_delegate,
        client,
        client_delegate,
        connected,
        lines,
        disconnected,
        failures,
    }
}

#[test]
fn echo_single_client() {
    let rig = rig();
    let port = rig.server.bound_port().unwrap();

    rig.client
        .connect("127.0.0.1", port, Family::Ipv4, Protocol::Tcp, None);

    let conn = rig.connected.recv_timeout(RECV_TIMEOUT).unwrap();
    match rig.server_events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ServerEvent::Connected(host) => assert!(host.starts_with("127.0.0.1")),
        other => panic!("expected Connected, got {:?}", other),
    }

    conn.write_line("hello").unwrap();
    let echoed = rig.lines.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(echoed, "hello");

    // Both sides observe a clean disconnect.
    conn.disconnect();
    let error = rig.disconnected.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(error.is_none(), "client side saw {:?}", error);
    match rig.server_events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ServerEvent::Disconnected(..) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }

    assert!(rig.failures.try_recv().is_err());
    drop(rig.client_delegate);
}

#[test]
fn several_lines_stay_in_order() {
    let rig = rig();
    let port = rig.server.bound_port().unwrap();
    rig.client
        .connect("127.0.0.1", port, Family::Ipv4, Protocol::Tcp, None);
    let conn = rig.connected.recv_timeout(RECV_TIMEOUT).unwrap();

    for i in 0..50 {
        conn.write_line(&format!("message {}", i)).unwrap();
    }
    for i in 0..50 {
        let line = rig.lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(line, format!("message {}", i));
    }
}

#[test]
fn graceful_peer_close_delivers_everything_then_reset() {
    let rig = rig();
    let port = rig.server.bound_port().unwrap();

    // A raw peer that sends an incomplete line and closes: the bytes must
    // survive to the disconnect callback, which reports a reset.
    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    match rig.server_events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {:?}", other),
    }

    peer.write_all(b"no newline here").unwrap();
    peer.flush().unwrap();
    drop(peer);

    match rig.server_events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ServerEvent::Disconnected(error, leftover) => {
            assert_eq!(leftover, b"no newline here");
            match error.as_deref() {
                Some(Error::ConnectionReset) => {}
                other => panic!("expected ConnectionReset, got {:?}", other),
            }
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
}

#[test]
fn context_lookup_finds_live_connections() {
    let rig = rig();
    let port = rig.server.bound_port().unwrap();
    rig.client
        .connect("127.0.0.1", port, Family::Ipv4, Protocol::Tcp, None);
    rig.connected.recv_timeout(RECV_TIMEOUT).unwrap();
    match rig.server_events.recv_timeout(RECV_TIMEOUT).unwrap() {
        ServerEvent::Connected(_) => {}
        other => panic!("expected Connected, got {:?}", other),
    }

    // The delegate tagged the connection on accept.
    let found = rig.server.connection_with_context("echo-peer");
    assert!(found.is_some());
    assert!(rig.server.connection_with_context("unknown").is_none());
    assert_eq!(rig.server.connection_count(), 1);
}

#[test]
fn user_object_round_trips() {
    let server = Server::new(0, Family::Ipv4);
    assert!(server.user_object().is_none());
    server.set_user_object("lobby");
    assert_eq!(server.user_object().as_deref(), Some("lobby"));
}

#[test]
fn listener_start_failure_is_synchronous() {
    let first = Server::new(0, Family::Ipv4);
    first.start().unwrap();
    let port = first.bound_port().unwrap();

    let second = Server::new(port, Family::Ipv4);
    match second.start() {
        Err(Error::ListenerStart(cause)) => match *cause {
            Error::Io(ref e) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            other => panic!("expected Io cause, got {:?}", other),
        },
        other => panic!("expected ListenerStart, got {:?}", other.map(|_| ())),
    }
    assert!(!second.started());
    assert!(first.started());
}
