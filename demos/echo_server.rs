//! Minimal line-echo server.
//!
//! Run with `cargo run --example echo_server [port]`, then talk to it
//! with `nc localhost 7777`.

use std::sync::Arc;
use std::time::Duration;

use ringsock::{Config, Connection, Family, Server, ServerDelegate};

struct Echo;

impl ServerDelegate for Echo {
    fn connected(&self, conn: &Arc<Connection>) {
        println!("+ {}", conn.host());
    }

    fn disconnected(&self, conn: &Arc<Connection>) {
        match conn.last_error() {
            Some(error) => println!("- {} ({})", conn.host(), error),
            None => println!("- {}", conn.host()),
        }
    }

    fn has_data(&self, conn: &Arc<Connection>) {
        loop {
            match conn.read_line() {
                Ok(Some(line)) => {
                    if let Err(error) = conn.write_line(&line) {
                        eprintln!("echo to {} failed: {}", conn.host(), error);
                        conn.disconnect();
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    // Binary junk on a line protocol; drop it.
                    let _ = conn.read_all_data();
                    return;
                }
            }
        }
    }

    fn stopped(&self) {
        println!("listener stopped");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7777);

    let server = Server::with_config(port, Family::Ipv4, Config::development());
    let delegate: Arc<dyn ServerDelegate> = Arc::new(Echo);
    server.set_delegate(&delegate);
    server.start()?;
    println!(
        "echoing on port {}",
        server.bound_port().unwrap_or(port)
    );

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
