use std::io;
use std::io::Read;
use std::io::Write;

/// Byte stream a transport pulls raw bytes from and pushes them to.
pub trait Stream: Read + Write {}

impl<T: Read + Write> Stream for T {}

/// A byte-in/byte-out wrapper installed over a connection's socket, e.g. a
/// TLS session.
///
/// The reactor routes every read and write of an upgraded connection through
/// the transport instead of touching the socket directly. A transport must
/// preserve the socket's non-blocking contract: partial progress on either
/// side, including mid-handshake, is reported as
/// [`io::ErrorKind::WouldBlock`] and the loop retries on the next readiness
/// event.
pub trait Transport: Send {
    /// Called once when the transport is installed; may kick off a handshake.
    fn started(&mut self, io: &mut dyn Stream) -> io::Result<()> {
        let _ = io;
        Ok(())
    }

    /// Reads unwrapped bytes into `buf`, pulling from the underlying stream
    /// as needed.
    fn read(&mut self, io: &mut dyn Stream, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the wrapped form of `buf` to the underlying stream, returning
    /// how many bytes of `buf` were consumed.
    fn write(&mut self, io: &mut dyn Stream, buf: &[u8]) -> io::Result<usize>;
}
