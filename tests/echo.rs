use anyhow::Result;
use gyre::Connection;
use gyre::ConnectionError;
use gyre::Error;
use gyre::Handler;
use gyre::Reactor;
use gyre::Stream;
use gyre::Transport;
use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tempdir::TempDir;

fn wait_until_running(reactor: &Reactor) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !reactor.running() {
        assert!(Instant::now() < deadline, "reactor never started");
        thread::sleep(Duration::from_millis(5));
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn payload() -> Vec<u8> {
    let mut payload = b"blah".repeat(99_999);
    payload.extend_from_slice(b"\n\n");
    payload
}

struct EchoServer;

impl Handler for EchoServer {
    fn on_read(&mut self, _reactor: &Reactor, conn: &mut Connection, data: &[u8]) {
        conn.send_data(data);
    }
}

/// Sends its payload on connect, closes once the full echo arrived and
/// reports everything it received on close.
struct EchoClient {
    payload: Vec<u8>,
    results: mpsc::Sender<Vec<u8>>,
}

impl Handler for EchoClient {
    fn on_connect(&mut self, _reactor: &Reactor, conn: &mut Connection) {
        conn.send_data(&self.payload);
    }

    fn on_read(&mut self, _reactor: &Reactor, conn: &mut Connection, _data: &[u8]) {
        if conn.received_data().len() >= self.payload.len() {
            conn.close(None);
        }
    }

    fn on_close(&mut self, _reactor: &Reactor, conn: &mut Connection, _reason: Option<&ConnectionError>) {
        let _ = self.results.send(conn.received_data().to_vec());
    }
}

/// Reports the close reason and nothing else.
struct CloseReporter {
    results: mpsc::Sender<Option<ConnectionError>>,
}

impl Handler for CloseReporter {
    fn on_close(&mut self, _reactor: &Reactor, _conn: &mut Connection, reason: Option<&ConnectionError>) {
        let _ = self.results.send(reason.cloned());
    }
}

#[test]
fn tcp_echo_round_trip() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || EchoServer)?;

    let payload = payload();
    let (tx, rx) = mpsc::channel();
    reactor.connect_tcp(
        "127.0.0.1",
        port,
        EchoClient {
            payload: payload.clone(),
            results: tx,
        },
    )?;

    let echoed = rx.recv_timeout(Duration::from_secs(30))?;
    assert_eq!(echoed, payload);
    // At minimum the listener is still attached.
    assert!(!reactor.connections().is_empty());

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn unix_echo_round_trip() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let dir = TempDir::new("gyre-echo")?;
    let path = dir.path().join("echo.sock");
    reactor.listen_unix(&path, || EchoServer)?;

    let payload = payload();
    let (tx, rx) = mpsc::channel();
    reactor.connect_unix(
        &path,
        EchoClient {
            payload: payload.clone(),
            results: tx,
        },
    )?;

    let echoed = rx.recv_timeout(Duration::from_secs(30))?;
    assert_eq!(echoed, payload);

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn unresolvable_host_reports_host_not_found() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let (tx, rx) = mpsc::channel();
    reactor.connect_tcp("blahblah.invalid", 9999, CloseReporter { results: tx })?;

    let reason = rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(reason, Some(ConnectionError::HostNotFound));

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn connecting_to_a_dead_port_reports_refused() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let (tx, rx) = mpsc::channel();
    reactor.connect_tcp("127.0.0.1", free_port(), CloseReporter { results: tx })?;

    let reason = rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(reason, Some(ConnectionError::Refused));

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

#[test]
fn listening_on_a_protected_path_raises_permission() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let err = reactor
        .listen_unix("/sys/gyre-test-listen.sock", || EchoServer)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::Permission)
    ));

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

/// Pushes a greeting at the peer and hangs up once it flushed.
struct OneShotServer;

impl Handler for OneShotServer {
    fn on_connect(&mut self, _reactor: &Reactor, conn: &mut Connection) {
        conn.send_data(b"hello, goodbye");
        conn.close_after_write();
    }
}

struct GreetingClient {
    results: mpsc::Sender<(Vec<u8>, Option<ConnectionError>)>,
}

impl Handler for GreetingClient {
    fn on_close(&mut self, _reactor: &Reactor, conn: &mut Connection, reason: Option<&ConnectionError>) {
        let _ = self
            .results
            .send((conn.received_data().to_vec(), reason.cloned()));
    }
}

#[test]
fn close_after_write_flushes_before_hanging_up() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || OneShotServer)?;

    let (tx, rx) = mpsc::channel();
    reactor.connect_tcp("127.0.0.1", port, GreetingClient { results: tx })?;

    let (received, reason) = rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(received, b"hello, goodbye");
    // The hang-up came from the peer, not from a local close.
    assert_eq!(reason, Some(ConnectionError::Closed));

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}

/// Flips every byte with a fixed key; two of these back to back cancel out,
/// which makes the transport plumbing observable in an echo round-trip.
struct XorTransport {
    key: u8,
}

impl Transport for XorTransport {
    fn read(&mut self, io: &mut dyn Stream, buf: &mut [u8]) -> io::Result<usize> {
        let n = io.read(buf)?;
        for byte in &mut buf[..n] {
            *byte ^= self.key;
        }
        Ok(n)
    }

    fn write(&mut self, io: &mut dyn Stream, buf: &[u8]) -> io::Result<usize> {
        let wrapped: Vec<u8> = buf.iter().map(|byte| byte ^ self.key).collect();
        io.write(&wrapped)
    }
}

struct XorEchoServer;

impl Handler for XorEchoServer {
    fn on_connect(&mut self, _reactor: &Reactor, conn: &mut Connection) {
        conn.start_tls(Box::new(XorTransport { key: 0x2a })).unwrap();
    }

    fn on_read(&mut self, _reactor: &Reactor, conn: &mut Connection, data: &[u8]) {
        conn.send_data(data);
    }
}

struct XorEchoClient {
    payload: Vec<u8>,
    results: mpsc::Sender<Vec<u8>>,
}

impl Handler for XorEchoClient {
    fn on_connect(&mut self, _reactor: &Reactor, conn: &mut Connection) {
        conn.start_tls(Box::new(XorTransport { key: 0x2a })).unwrap();
        conn.send_data(&self.payload);
    }

    fn on_read(&mut self, _reactor: &Reactor, conn: &mut Connection, _data: &[u8]) {
        if conn.received_data().len() >= self.payload.len() {
            conn.close(None);
        }
    }

    fn on_close(&mut self, _reactor: &Reactor, conn: &mut Connection, _reason: Option<&ConnectionError>) {
        let _ = self.results.send(conn.received_data().to_vec());
    }
}

#[test]
fn transport_upgrade_round_trip() -> Result<()> {
    let reactor = Reactor::default();
    let handle = reactor.run_in_thread()?;
    wait_until_running(&reactor);

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || XorEchoServer)?;

    let payload = b"ping pong ".repeat(1_000);
    let (tx, rx) = mpsc::channel();
    reactor.connect_tcp(
        "127.0.0.1",
        port,
        XorEchoClient {
            payload: payload.clone(),
            results: tx,
        },
    )?;

    let echoed = rx.recv_timeout(Duration::from_secs(30))?;
    assert_eq!(echoed, payload);

    reactor.stop();
    handle.join().unwrap();
    Ok(())
}
