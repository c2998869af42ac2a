//! Punch-server wire protocol.
//!
//! A persistent stream session carries fixed-layout frames: a u16 tag
//! followed by a payload whose length is implied by the tag. Peer records
//! are 20 bytes: a NUL-padded dotted-quad, the port and the NAT type.

use crate::error::{Error, Result};
use crate::stun::NatType;
use std::net::Ipv4Addr;

pub const ENROLL: u16 = 0x01;
pub const GET_PEER_INFO: u16 = 0x02;
pub const NOTIFY_PEER: u16 = 0x03;

/// ip field is a zero padded ASCII dotted quad, 15 chars max
pub const IP_LEN: usize = 16;
pub const PEER_INFO_LEN: usize = IP_LEN + 2 + 2;

/// Single byte the server sends in place of a peer record when the
/// requested peer is not enrolled.
pub const OFFLINE: u8 = 0x00;

/// A peer as the punch server sees it: external address plus NAT
/// classification. The server holds the authoritative copy, clients only
/// ever get snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub nat_type: NatType,
}

impl PeerInfo {
    pub fn encode(&self) -> [u8; PEER_INFO_LEN] {
        let mut buf = [0u8; PEER_INFO_LEN];
        let ip = self.ip.to_string();
        buf[..ip.len()].copy_from_slice(ip.as_bytes());
        buf[IP_LEN..IP_LEN + 2].copy_from_slice(&self.port.to_be_bytes());
        buf[IP_LEN + 2..].copy_from_slice(&self.nat_type.to_u16().to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PEER_INFO_LEN {
            return Err(Error::Malformed("short peer record"));
        }

        let end = buf[..IP_LEN].iter().position(|&b| b == 0).unwrap_or(IP_LEN);
        let ip = std::str::from_utf8(&buf[..end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::Malformed("bad peer ip"))?;

        Ok(Self {
            ip,
            port: u16::from_be_bytes([buf[IP_LEN], buf[IP_LEN + 1]]),
            nat_type: NatType::from_u16(u16::from_be_bytes([buf[IP_LEN + 2], buf[IP_LEN + 3]])),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Enroll(PeerInfo),
    GetPeerInfo(u32),
    NotifyPeer(u32),
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + PEER_INFO_LEN);
        match self {
            Request::Enroll(info) => {
                buf.extend_from_slice(&ENROLL.to_be_bytes());
                buf.extend_from_slice(&info.encode());
            }
            Request::GetPeerInfo(id) => {
                buf.extend_from_slice(&GET_PEER_INFO.to_be_bytes());
                buf.extend_from_slice(&id.to_be_bytes());
            }
            Request::NotifyPeer(id) => {
                buf.extend_from_slice(&NOTIFY_PEER.to_be_bytes());
                buf.extend_from_slice(&id.to_be_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::Malformed("short request"));
        }

        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        let payload = &buf[2..];
        match tag {
            ENROLL => Ok(Request::Enroll(PeerInfo::decode(payload)?)),
            GET_PEER_INFO | NOTIFY_PEER => {
                if payload.len() < 4 {
                    return Err(Error::Malformed("short peer id"));
                }
                let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if tag == GET_PEER_INFO {
                    Ok(Request::GetPeerInfo(id))
                } else {
                    Ok(Request::NotifyPeer(id))
                }
            }
            _ => Err(Error::Protocol("unknown request tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> PeerInfo {
        PeerInfo {
            ip: Ipv4Addr::new(203, 0, 113, 97),
            port: 34780,
            nat_type: NatType::Symmetric,
        }
    }

    #[test]
    fn peer_info_layout() {
        let buf = info().encode();
        assert_eq!(&buf[..12], b"203.0.113.97");
        assert!(buf[12..IP_LEN].iter().all(|&b| b == 0));
        assert_eq!(buf[IP_LEN..IP_LEN + 2], 34780u16.to_be_bytes());
        assert_eq!(buf[IP_LEN + 2..], 5u16.to_be_bytes());
    }

    #[test]
    fn peer_info_roundtrip() {
        assert_eq!(PeerInfo::decode(&info().encode()).unwrap(), info());
    }

    #[test]
    fn short_peer_record_is_rejected() {
        assert!(matches!(
            PeerInfo::decode(&info().encode()[..PEER_INFO_LEN - 1]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn garbage_ip_is_rejected() {
        let mut buf = info().encode();
        buf[0] = b'x';
        assert!(matches!(
            PeerInfo::decode(&buf),
            Err(Error::Malformed("bad peer ip"))
        ));
    }

    #[test]
    fn request_frames() {
        let enroll = Request::Enroll(info()).encode();
        assert_eq!(enroll.len(), 2 + PEER_INFO_LEN);
        assert_eq!(&enroll[..2], &[0x00, 0x01]);

        let get = Request::GetPeerInfo(0x01020304).encode();
        assert_eq!(get, vec![0x00, 0x02, 0x01, 0x02, 0x03, 0x04]);

        let notify = Request::NotifyPeer(7).encode();
        assert_eq!(notify, vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn request_roundtrip() {
        for req in [
            Request::Enroll(info()),
            Request::GetPeerInfo(42),
            Request::NotifyPeer(42),
        ] {
            assert_eq!(Request::decode(&req.encode()).unwrap(), req);
        }
    }
}
