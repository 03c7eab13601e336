use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket};

/// Raw datagram boundary the session drives: fire a packed message at the
/// destination, then wait (bounded) for whatever the wire sends back.
/// Implemented by `RawSocket` for real use and by a scripted fake in the
/// session tests.
pub trait Transport {
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Block for at most `timeout` for an inbound datagram. Returns the
    /// number of bytes written into `buf` and the sender's address.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, IpAddr)>;
}

/// Raw ICMP socket bound to a single destination. Creating one requires
/// the usual raw-socket privileges; that is entirely the OS's business,
/// surfaced here as an io::Error from `new`.
pub struct RawSocket {
    socket: Socket,
    dest: SockAddr,
}

impl RawSocket {
    pub fn new(address: IpAddr) -> Result<Self> {
        let stype = socket2::Type::raw().cloexec();
        let socket = Socket::new(Domain::ipv4(), stype, Some(Protocol::icmpv4()))?;

        let sock_address = SocketAddr::from((address, 0));

        Ok(RawSocket {
            socket,
            dest: SockAddr::from(sock_address),
        })
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        self.socket.set_ttl(ttl)
    }
}

impl Transport for RawSocket {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.socket.send_to(payload, &self.dest).and(Ok(()))
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, IpAddr)> {
        self.socket.set_read_timeout(Some(timeout))?;
        let (bytes, from) = self.socket.recv_from(buf)?;

        let source = from
            .as_std()
            .map(|addr| addr.ip())
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "non-inet source address"))?;

        Ok((bytes, source))
    }
}
