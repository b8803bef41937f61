//! UDP transport to a single Marstek device
//!
//! One socket, one datagram out, at most one datagram back. Retries belong to
//! the callers.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::types::DeviceAddress;
use crate::errors::TransportError;

/// Largest reply the device sends comfortably fits.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Request/response exchange with the device
pub trait Transport: Send {
    /// Human readable peer, for logs and errors
    fn peer(&self) -> String;

    /// Send one datagram and wait up to `timeout` for the reply from the device.
    fn send_and_receive(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Blocking UDP transport bound once for the session
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

fn unspecified(peer: &SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    }
}

fn is_refusal(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

impl UdpTransport {
    /// Bind the local endpoint.
    ///
    /// A configured local port that is already taken falls back to an
    /// OS-assigned one.
    pub fn bind(address: &DeviceAddress) -> Result<Self, TransportError> {
        let peer = address.socket_addr();

        let socket = match address.local_port {
            Some(port) => UdpSocket::bind(unspecified(&peer, port)).or_else(|e| {
                debug!("Could not bind local port {}, using random port: {}", port, e);
                UdpSocket::bind(unspecified(&peer, 0))
            }),
            None => UdpSocket::bind(unspecified(&peer, 0)),
        }
        .map_err(|e| TransportError::BindFailed {
            port: address.local_port.unwrap_or(0),
            reason: e.to_string(),
        })?;

        if let Ok(local) = socket.local_addr() {
            debug!("UDP socket bound to {} for device {}", local, peer);
        }

        Ok(Self {
            socket: Some(socket),
            peer,
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Release the socket. Further exchanges fail as fatal.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP socket to {} closed", self.peer);
        }
    }
}

/// Discard datagrams that arrived after an earlier exchange timed out.
fn drain(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    let result = loop {
        match socket.recv_from(buffer) {
            Ok((len, from)) => trace!("Dropping stale datagram ({} bytes) from {}", len, from),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if is_refusal(e.kind()) => continue,
            Err(e) => break Err(e),
        }
    };
    socket.set_nonblocking(false)?;
    result
}

fn exchange(
    socket: &UdpSocket,
    peer: SocketAddr,
    buffer: &mut [u8],
    payload: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let unreachable = |e: io::Error| TransportError::Unreachable {
        peer: peer.to_string(),
        reason: e.to_string(),
    };

    drain(socket, buffer).map_err(TransportError::Fatal)?;

    match socket.send_to(payload, peer) {
        Ok(_) => trace!("Sent {} bytes to {}", payload.len(), peer),
        Err(e) if is_refusal(e.kind()) => return Err(unreachable(e)),
        Err(e) => return Err(TransportError::Fatal(e)),
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout {
                peer: peer.to_string(),
                waited: timeout,
            });
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(TransportError::Fatal)?;

        match socket.recv_from(buffer) {
            Ok((len, from)) if from == peer => {
                trace!("Received {} bytes from {}", len, from);
                return Ok(buffer[..len].to_vec());
            }
            Ok((len, from)) => {
                debug!("Discarding {} bytes from unexpected sender {}", len, from);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(TransportError::Timeout {
                    peer: peer.to_string(),
                    waited: timeout,
                });
            }
            Err(e) if is_refusal(e.kind()) => return Err(unreachable(e)),
            Err(e) => return Err(TransportError::Fatal(e)),
        }
    }
}

impl Transport for UdpTransport {
    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send_and_receive(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(TransportError::Fatal(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket closed",
            )));
        };

        let result = exchange(socket, self.peer, &mut self.buffer, payload, timeout);
        if let Err(TransportError::Fatal(e)) = &result {
            warn!("Closing UDP socket to {} after fatal error: {}", self.peer, e);
            self.close();
        }
        result
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::thread;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    /// A fake device on localhost answering `replies` in order.
    fn fake_device(replies: Vec<&'static [u8]>) -> (SocketAddr, thread::JoinHandle<Vec<Vec<u8>>>) {
        let socket = UdpSocket::bind((localhost(), 0)).unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buffer = [0u8; 1024];
            for reply in replies {
                let (len, from) = socket.recv_from(&mut buffer).unwrap();
                seen.push(buffer[..len].to_vec());
                socket.send_to(reply, from).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    fn transport_for(addr: SocketAddr) -> UdpTransport {
        UdpTransport::bind(&DeviceAddress::new(addr.ip(), addr.port(), None)).unwrap()
    }

    #[test]
    fn test_send_and_receive() {
        let (addr, device) = fake_device(vec![br#"{"id":1,"result":{}}"#]);
        let mut transport = transport_for(addr);

        let reply = transport
            .send_and_receive(b"ping", Duration::from_secs(2))
            .unwrap();

        assert_eq!(reply, br#"{"id":1,"result":{}}"#);
        assert_eq!(device.join().unwrap(), vec![b"ping".to_vec()]);
    }

    #[test]
    fn test_timeout_without_reply() {
        let silent = UdpSocket::bind((localhost(), 0)).unwrap();
        let mut transport = transport_for(silent.local_addr().unwrap());

        let started = Instant::now();
        let result = transport.send_and_receive(b"ping", Duration::from_millis(150));

        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(result.unwrap_err().is_transient());
    }

    #[test]
    fn test_discards_unexpected_sender() {
        let (addr, device) = fake_device(vec![b"from-device"]);
        let mut transport = transport_for(addr);
        let local = transport.local_addr().unwrap();
        let local = SocketAddr::new(localhost(), local.port());

        let intruder = UdpSocket::bind((localhost(), 0)).unwrap();
        let handle = thread::spawn(move || {
            let mut transport = transport;
            transport.send_and_receive(b"ping", Duration::from_secs(2))
        });
        // Racing the device is fine: either order must yield the device reply.
        intruder.send_to(b"from-intruder", local).unwrap();

        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply, b"from-device");
        device.join().unwrap();
    }

    #[test]
    fn test_closed_transport_is_fatal() {
        let silent = UdpSocket::bind((localhost(), 0)).unwrap();
        let mut transport = transport_for(silent.local_addr().unwrap());
        transport.close();

        let result = transport.send_and_receive(b"ping", Duration::from_millis(50));
        match result {
            Err(e @ TransportError::Fatal(_)) => assert!(!e.is_transient()),
            other => panic!("expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_fixed_local_port_falls_back_when_taken() {
        let taken = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let transport =
            UdpTransport::bind(&DeviceAddress::new(localhost(), 30000, Some(port))).unwrap();

        assert_ne!(transport.local_addr().unwrap().port(), port);
    }
}
