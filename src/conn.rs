//! Length-prefixed socket I/O and small UDP helpers.
//!
//! `recv_frame`/`send_frame` implement the `<u32 length><bytes>` framing
//! that [`crate::message`] packs its type+body into; they are generic over
//! `Read`/`Write` so tests can exercise them against in-memory buffers
//! instead of a real `TcpStream`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use crate::error::{Error, Result};

/// Read one length-prefixed frame: a 4-byte big-endian length, then exactly
/// that many bytes. A zero-byte read while expecting the length prefix
/// means the peer closed the connection.
pub fn recv_frame<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(stream, &mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

/// Write one length-prefixed frame, retrying partial writes.
pub fn send_frame<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}

/// Like `Read::read_exact`, but treats an immediate zero-byte read at the
/// start of a frame (the peer closing cleanly between frames) as `Closed`
/// rather than a generic `UnexpectedEof` io error.
fn read_exact_or_closed<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(Error::Io(closed_error())),
            Ok(0) => return Err(Error::Malformed("peer closed mid-frame")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection")
}

/// `1` if data is available to read within `timeout`, `0` on timeout, `-1`
/// on error. Used by loops that must not block indefinitely on a socket
/// that may never deliver anything (e.g. while polling for shutdown).
pub fn read_available(stream: &TcpStream, timeout: Duration) -> i32 {
    match stream.set_read_timeout(Some(timeout)) {
        Err(_) => return -1,
        Ok(()) => {}
    }
    let mut probe = [0u8; 1];
    let result = match stream.peek(&mut probe) {
        Ok(0) => -1, // peer closed
        Ok(_) => 1,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => 0,
        Err(_) => -1,
    };
    let _ = stream.set_read_timeout(None);
    result
}

/// Send an opaque WDP datagram to `addr`.
pub fn udp_sendto(socket: &UdpSocket, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
    socket.send_to(bytes, addr)?;
    Ok(())
}

/// Receive a WDP datagram, returning the sender's address alongside the
/// payload so the caller can stamp `source_address`/`source_port`.
pub fn udp_recvfrom(socket: &UdpSocket, buf: &mut [u8]) -> Result<(SocketAddr, usize)> {
    let (n, addr) = socket.recv_from(buf)?;
    Ok((addr, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_through_a_buffer() {
        let mut buf = Vec::new();
        send_frame(&mut buf, b"hello").unwrap();
        let mut cur = Cursor::new(buf);
        let got = recv_frame(&mut cur).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn empty_source_is_closed() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        let err = recv_frame(&mut cur).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn short_body_is_io_error() {
        // declares a 10-byte body but only 3 are present
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cur = Cursor::new(buf);
        assert!(recv_frame(&mut cur).is_err());
    }
}
