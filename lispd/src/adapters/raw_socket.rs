//! Raw-IP `UnderlaySink`: writes fully-formed IPv4 datagrams (our own
//! encapsulation already includes the outer IP header) to a raw socket with
//! `IP_HDRINCL` set.

use lisp_core::{LispError, Result, UnderlaySink};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub struct RawIpSink {
    socket: Socket,
}

impl RawIpSink {
    pub fn new() -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(255)))?;
        socket.set_header_included_v4(true)?;
        Ok(Self { socket })
    }
}

impl UnderlaySink for RawIpSink {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 20 {
            return Err(LispError::Emission("buffer too short to contain an IPv4 header".into()));
        }
        let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);
        let addr: SocketAddr = SocketAddrV4::new(dst, 0).into();
        let written = self.socket.send_to(bytes, &addr.into()).map_err(|e| LispError::Emission(e.to_string()))?;
        if written != bytes.len() {
            return Err(LispError::Emission(format!("short write: sent {written} of {} bytes", bytes.len())));
        }
        Ok(())
    }
}
