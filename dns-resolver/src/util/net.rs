use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Maximum size of a single inbound datagram this implementation will
/// read. 512 octets is the classical minimum; this implementation
/// accepts up to double that without setting the truncation bit.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Send `bytes` to `target` from a freshly bound ephemeral UDP socket
/// and wait up to `timeout` for one reply datagram, which is returned
/// unparsed. The socket is scoped to this single send/recv cycle and
/// is closed when this function returns, on every exit path.
///
/// Returns `Ok(None)` on timeout; `Err` for any other I/O failure.
pub fn send_and_receive(
    target: SocketAddr,
    bytes: &[u8],
    timeout: Duration,
) -> io::Result<Option<Vec<u8>>> {
    let bind_addr: SocketAddr = if target.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.connect(target)?;
    socket.send(bytes)?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    match socket.recv(&mut buf) {
        Ok(n) => {
            buf.truncate(n);
            Ok(Some(buf))
        }
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
