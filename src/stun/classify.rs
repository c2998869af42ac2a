use crate::error::{Error, Result};
use crate::stun::message::{StunAddress, StunMessage, BIND_RESPONSE};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// NAT classification, in the punch-server wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Blocked = 0,
    OpenInternet = 1,
    FullCone = 2,
    RestrictedCone = 3,
    PortRestrictedCone = 4,
    Symmetric = 5,
    Unknown = 6,
}

impl NatType {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0 => NatType::Blocked,
            1 => NatType::OpenInternet,
            2 => NatType::FullCone,
            3 => NatType::RestrictedCone,
            4 => NatType::PortRestrictedCone,
            5 => NatType::Symmetric,
            _ => NatType::Unknown,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            NatType::Blocked => "blocked",
            NatType::OpenInternet => "open internet",
            NatType::FullCone => "full cone",
            NatType::RestrictedCone => "restricted cone NAT",
            NatType::PortRestrictedCone => "port-restricted cone NAT",
            NatType::Symmetric => "symmetric NAT",
            NatType::Unknown => "unknown",
        };
        f.write_str(desc)
    }
}

/// Outcome of a classification run. `external` is the first
/// MAPPED-ADDRESS the primary server reported, whatever branch the
/// decision tree ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub nat_type: NatType,
    pub external: Option<SocketAddrV4>,
}

/// Runs the classic STUN test sequence against a server that supports
/// CHANGE-REQUEST and advertises an alternate endpoint.
pub struct Classifier {
    recv_timeout: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(5),
        }
    }
}

impl Classifier {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_timeout(recv_timeout: Duration) -> Self {
        Self { recv_timeout }
    }

    /// Classify the local NAT. Best effort by contract: apart from a bind
    /// failure on `local_addr`, every socket error collapses into
    /// `NatType::Unknown` rather than an `Err`.
    pub fn classify(
        &self,
        stun_host: &str,
        stun_port: u16,
        local_addr: SocketAddrV4,
    ) -> Result<Classification> {
        let socket = bind_udp(local_addr)?;

        let server_addr = match resolve_v4(stun_host, stun_port) {
            Some(addr) => addr,
            None => {
                log::warn!("cannot resolve stun host {}", stun_host);
                return Ok(unknown(None));
            }
        };

        // Test I: plain bind request to the primary server.
        let first = match self.exchange(&socket, server_addr, false, false) {
            Ok(Some(resp)) => resp,
            Ok(None) => {
                return Ok(Classification {
                    nat_type: NatType::Blocked,
                    external: None,
                })
            }
            Err(_) => return Ok(unknown(None)),
        };

        let mapped = match first.mapped_address() {
            Some(mapped) => mapped,
            None => return Ok(unknown(None)),
        };
        let external = Some(SocketAddrV4::new(mapped.ip, mapped.port));
        log::debug!("mapped address {}:{}", mapped.ip, mapped.port);

        // Compare against the address we actually bound, the requested
        // port may have been 0.
        let bound = match socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            _ => return Ok(unknown(external)),
        };
        if mapped.ip == *bound.ip() && mapped.port == bound.port() {
            return Ok(Classification {
                nat_type: NatType::OpenInternet,
                external,
            });
        }

        // Without an alternate server the test cannot continue.
        let changed = match first.changed_address() {
            Some(changed) => changed,
            None => {
                log::warn!("no alternate server advertised, can't detect nat type");
                return Ok(unknown(external));
            }
        };
        let alt_addr = SocketAddrV4::new(changed.ip, changed.port);

        // Test II: ask the server to reply from its other ip and port.
        match self.exchange(&socket, server_addr, true, true) {
            Ok(Some(_)) => {
                return Ok(Classification {
                    nat_type: NatType::FullCone,
                    external,
                })
            }
            Ok(None) => {}
            Err(_) => return Ok(unknown(external)),
        }

        // Test I again, against the alternate server. A different mapping
        // means the NAT allocates per destination.
        let second = match self.exchange(&socket, alt_addr, false, false) {
            Ok(Some(resp)) => resp,
            _ => {
                log::warn!("no reply from alternate server {}", alt_addr);
                return Ok(unknown(external));
            }
        };
        match second.mapped_address() {
            Some(remapped) if remapped == mapped => {}
            Some(_) => {
                return Ok(Classification {
                    nat_type: NatType::Symmetric,
                    external,
                })
            }
            None => return Ok(unknown(external)),
        }

        // Test III: changed port only.
        let nat_type = match self.exchange(&socket, alt_addr, false, true) {
            Ok(Some(_)) => NatType::RestrictedCone,
            Ok(None) => NatType::PortRestrictedCone,
            Err(_) => return Ok(unknown(external)),
        };

        Ok(Classification { nat_type, external })
    }

    /// One request/response exchange. `Ok(None)` means no reply within
    /// the window; malformed or unrelated replies count as socket errors.
    fn exchange(
        &self,
        socket: &UdpSocket,
        dst: SocketAddrV4,
        change_ip: bool,
        change_port: bool,
    ) -> Result<Option<StunMessage>> {
        let req = StunMessage::bind_request(change_ip, change_port);
        socket.send_to(&req.encode(), dst)?;
        socket.set_read_timeout(Some(self.recv_timeout))?;

        let mut buf = [0u8; 512];
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let resp = StunMessage::decode(&buf[..n])?;
        if resp.msg_type != BIND_RESPONSE || resp.transaction_id != req.transaction_id {
            return Err(Error::Protocol("unexpected stun response"));
        }

        Ok(Some(resp))
    }
}

fn unknown(external: Option<SocketAddrV4>) -> Classification {
    Classification {
        nat_type: NatType::Unknown,
        external,
    }
}

fn resolve_v4(host: &str, port: u16) -> Option<SocketAddrV4> {
    (host, port).to_socket_addrs().ok()?.find_map(|a| match a {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(_) => None,
    })
}

fn bind_udp(local_addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&SocketAddr::V4(local_addr).into())
        .map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                Error::PortUnavailable
            } else {
                Error::Socket(e)
            }
        })?;
    Ok(socket.into())
}
