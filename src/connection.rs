use crate::error::ConnectionError;
use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::transport::Transport;
use log::debug;
use mio::Interest;
use mio::Registry;
use mio::Token;
use std::io;
use std::io::Read;
use std::io::Write;

/// Size of the stack buffer used to drain readable sockets.
const READ_CHUNK: usize = 4096;

/// Identifies one connection inside its reactor's registry. The id doubles
/// as the selector token of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) usize);

/// The part a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated locally via `connect`.
    Client,
    /// Produced by a listener accepting a peer.
    Server,
    /// Accepts new peers.
    Listener,
}

/// User-supplied callbacks the reactor dispatches readiness to.
///
/// Every method defaults to a no-op; implement the ones the protocol needs.
/// Handlers migrate to the loop thread, so they must be [`Send`]; after that,
/// all callbacks run there and never concurrently.
pub trait Handler: Send {
    /// The connection is established: a client socket finished its
    /// non-blocking connect, or a listener accepted this peer.
    fn on_connect(&mut self, reactor: &Reactor, conn: &mut Connection) {
        let _ = (reactor, conn);
    }

    /// Bytes arrived. The same bytes are also appended to
    /// [`Connection::received_data`].
    fn on_read(&mut self, reactor: &Reactor, conn: &mut Connection, data: &[u8]) {
        let _ = (reactor, conn, data);
    }

    /// The outgoing buffer fully drained.
    fn on_write(&mut self, reactor: &Reactor, conn: &mut Connection) {
        let _ = (reactor, conn);
    }

    /// The connection terminated. `reason` is `None` for a locally requested
    /// clean close and an error for everything else. Invoked at most once;
    /// not invoked for closes driven by reactor shutdown.
    fn on_close(&mut self, reactor: &Reactor, conn: &mut Connection, reason: Option<&ConnectionError>) {
        let _ = (reactor, conn, reason);
    }
}

/// State machine around one non-blocking socket: the byte buffers, the close
/// semantics and the optional transport upgrade.
///
/// Connections are owned by their reactor; handlers get `&mut` access during
/// callbacks and talk back through methods like [`send_data`] and [`close`].
///
/// [`send_data`]: Connection::send_data
/// [`close`]: Connection::close
pub struct Connection {
    id: ConnectionId,
    role: Role,
    socket: Option<Socket>,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    connected: bool,
    closed: bool,
    close_requested: bool,
    close_reason: Option<ConnectionError>,
    close_after_write: bool,
    transport: Option<Box<dyn Transport>>,
    pending_error: Option<ConnectionError>,
    registered: Option<Interest>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, role: Role, socket: Socket) -> Self {
        Connection {
            id,
            role,
            socket: Some(socket),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            // Client sockets still have a connect in flight; everything else
            // is usable from the start.
            connected: role != Role::Client,
            closed: false,
            close_requested: false,
            close_reason: None,
            close_after_write: false,
            transport: None,
            pending_error: None,
            registered: None,
        }
    }

    /// A connection that failed at creation. It never registers with the
    /// selector; attaching it only reports the stored error via `on_close`.
    pub(crate) fn dead(id: ConnectionId, role: Role, reason: ConnectionError) -> Self {
        Connection {
            id,
            role,
            socket: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            connected: false,
            closed: false,
            close_requested: false,
            close_reason: None,
            close_after_write: false,
            transport: None,
            pending_error: Some(reason),
            registered: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True once the socket finished connecting (always true for accepted
    /// sockets and listeners).
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Every byte received so far.
    pub fn received_data(&self) -> &[u8] {
        &self.incoming
    }

    /// Appends bytes to the outgoing buffer. The reactor keeps the socket
    /// selected for write readiness until the buffer drains.
    pub fn send_data(&mut self, data: &[u8]) {
        if self.closed || self.close_requested {
            debug!("send_data on closing connection {:?}, dropping {} bytes", self.id, data.len());
            return;
        }
        self.outgoing.extend_from_slice(data);
    }

    /// Requests a clean close once the outgoing buffer has fully drained.
    pub fn close_after_write(&mut self) {
        self.close_after_write = true;
    }

    /// Requests an immediate close. The reactor detaches the connection and
    /// invokes `on_close` with `reason` right after the current callback
    /// returns.
    pub fn close(&mut self, reason: Option<ConnectionError>) {
        self.close_requested = true;
        self.close_reason = reason;
    }

    /// Installs a transport (e.g. a TLS session) over the socket. All
    /// subsequent reads and writes go through it. A `WouldBlock` from the
    /// handshake kick-off is fine: the handshake then progresses on
    /// readiness like any other I/O.
    pub fn start_tls(&mut self, mut transport: Box<dyn Transport>) -> io::Result<()> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection has no socket",
                ))
            }
        };

        match transport.started(socket) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        self.transport = Some(transport);
        Ok(())
    }
}

//---------------------------------------------------------
//  REACTOR-SIDE MECHANICS.
//---------------------------------------------------------

impl Connection {
    pub(crate) fn token(&self) -> Token {
        Token(self.id.0)
    }

    pub(crate) fn take_pending_error(&mut self) -> Option<ConnectionError> {
        self.pending_error.take()
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub(crate) fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// A callback asked for this connection to go away.
    pub(crate) fn wants_close(&self) -> bool {
        self.close_requested || (self.close_after_write && self.outgoing.is_empty())
    }

    pub(crate) fn take_close_reason(&mut self) -> Option<ConnectionError> {
        self.close_reason.take()
    }

    pub(crate) fn buffer_received(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    pub(crate) fn take_socket_error(&mut self) -> Option<io::Error> {
        self.socket
            .as_ref()
            .and_then(|socket| socket.take_error().ok().flatten())
    }

    /// The interest the socket should currently be registered with, or
    /// `None` when there is nothing left to watch.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        if self.closed {
            return None;
        }
        self.socket.as_ref()?;

        let interest = match self.role {
            Role::Listener => Interest::READABLE,
            // Write readiness is wanted while bytes are queued, and for the
            // connect-completion signal of a client socket.
            _ if !self.outgoing.is_empty() || !self.connected => {
                Interest::READABLE | Interest::WRITABLE
            }
            _ => Interest::READABLE,
        };

        Some(interest)
    }

    /// Registers or re-registers the socket whenever the desired interest
    /// changed since the last registration.
    pub(crate) fn sync_registration(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = match self.desired_interest() {
            Some(interest) => interest,
            None => return Ok(()),
        };
        if self.registered == Some(desired) {
            return Ok(());
        }

        let token = self.token();
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok(()),
        };
        match self.registered {
            Some(_) => registry.reregister(socket, token, desired)?,
            None => registry.register(socket, token, desired)?,
        }
        self.registered = Some(desired);
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            if let Some(socket) = self.socket.as_mut() {
                let _ = registry.deregister(socket);
            }
        }
    }

    /// Drops the socket handle; this is the single point where the OS socket
    /// closes. The registry entry must already be gone by now.
    pub(crate) fn release_socket(&mut self) {
        self.closed = true;
        self.socket = None;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Writes as much of the outgoing buffer as the socket (or transport)
    /// accepts. Returns whether the buffer fully drained.
    pub(crate) fn flush_outgoing(&mut self) -> Result<bool, ConnectionError> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok(true),
        };

        while !self.outgoing.is_empty() {
            let result = match self.transport.as_mut() {
                Some(transport) => transport.write(&mut *socket, &self.outgoing),
                None => socket.write(&self.outgoing),
            };
            match result {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(self.outgoing.is_empty())
    }

    /// Reads everything currently available without blocking. Returns the
    /// bytes plus whether the peer hung up.
    pub(crate) fn read_available(&mut self) -> Result<(Vec<u8>, bool), ConnectionError> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Ok((Vec::new(), false)),
        };

        let mut data = Vec::new();
        let mut chunk = [0; READ_CHUNK];
        let mut eof = false;

        loop {
            let result = match self.transport.as_mut() {
                Some(transport) => transport.read(&mut *socket, &mut chunk),
                None => socket.read(&mut chunk),
            };
            match result {
                // Reading zero bytes means the other side is done writing.
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok((data, eof))
    }

    /// Accepts one peer on a listening socket; `None` when the backlog is
    /// drained.
    pub(crate) fn accept(&mut self) -> Option<io::Result<Socket>> {
        let socket = self.socket.as_ref()?;
        match socket.accept() {
            Ok(accepted) => Some(Ok(accepted)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => Some(Err(err)),
        }
    }
}
