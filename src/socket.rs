use crate::error::ConnectionError;
use mio::event::Source;
use mio::net::TcpListener;
use mio::net::TcpStream;
use mio::net::UnixListener;
use mio::net::UnixStream;
use mio::Interest;
use mio::Registry;
use mio::Token;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::Path;

/// One of the four socket shapes the reactor multiplexes. All of them are
/// non-blocking by construction.
pub(crate) enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
    TcpListener(TcpListener),
    UnixListener(UnixListener),
}

impl Socket {
    /// Pulls the pending OS error off the socket, if any.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Socket::Tcp(socket) => socket.take_error(),
            Socket::Unix(socket) => socket.take_error(),
            Socket::TcpListener(socket) => socket.take_error(),
            Socket::UnixListener(socket) => socket.take_error(),
        }
    }

    /// Accepts one queued peer on a listening socket.
    pub(crate) fn accept(&self) -> io::Result<Socket> {
        match self {
            Socket::TcpListener(listener) => {
                listener.accept().map(|(socket, _)| Socket::Tcp(socket))
            }
            Socket::UnixListener(listener) => {
                listener.accept().map(|(socket, _)| Socket::Unix(socket))
            }
            _ => Err(io::ErrorKind::Unsupported.into()),
        }
    }
}

impl Source for Socket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Tcp(socket) => socket.register(registry, token, interests),
            Socket::Unix(socket) => socket.register(registry, token, interests),
            Socket::TcpListener(socket) => socket.register(registry, token, interests),
            Socket::UnixListener(socket) => socket.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Socket::Tcp(socket) => socket.reregister(registry, token, interests),
            Socket::Unix(socket) => socket.reregister(registry, token, interests),
            Socket::TcpListener(socket) => socket.reregister(registry, token, interests),
            Socket::UnixListener(socket) => socket.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Socket::Tcp(socket) => socket.deregister(registry),
            Socket::Unix(socket) => socket.deregister(registry),
            Socket::TcpListener(socket) => socket.deregister(registry),
            Socket::UnixListener(socket) => socket.deregister(registry),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(socket) => socket.read(buf),
            Socket::Unix(socket) => socket.read(buf),
            _ => Err(io::ErrorKind::Unsupported.into()),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(socket) => socket.write(buf),
            Socket::Unix(socket) => socket.write(buf),
            _ => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(socket) => socket.flush(),
            Socket::Unix(socket) => socket.flush(),
            _ => Ok(()),
        }
    }
}

/// Resolves `host:port`, folding every resolver failure into the unknown-host
/// error.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectionError::HostNotFound)?
        .next()
        .ok_or(ConnectionError::HostNotFound)
}

/// Opens a non-blocking TCP stream towards `host:port`. Completion (or
/// refusal) of the in-progress connect surfaces later through readiness.
pub(crate) fn connect_tcp(host: &str, port: u16) -> Result<Socket, ConnectionError> {
    let addr = resolve(host, port)?;
    TcpStream::connect(addr)
        .map(Socket::Tcp)
        .map_err(ConnectionError::from)
}

/// Opens a non-blocking UNIX-domain stream towards `path`.
pub(crate) fn connect_unix(path: &Path) -> Result<Socket, ConnectionError> {
    UnixStream::connect(path)
        .map(Socket::Unix)
        .map_err(ConnectionError::from)
}

/// Binds a TCP listener on `host:port`.
pub(crate) fn listen_tcp(host: &str, port: u16) -> Result<Socket, ConnectionError> {
    let addr = resolve(host, port)?;
    TcpListener::bind(addr)
        .map(Socket::TcpListener)
        .map_err(ConnectionError::from)
}

/// Binds a UNIX-domain listener at `path`.
pub(crate) fn listen_unix(path: &Path) -> Result<Socket, ConnectionError> {
    UnixListener::bind(path)
        .map(Socket::UnixListener)
        .map_err(ConnectionError::from)
}
