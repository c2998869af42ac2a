use crate::error::{Error, Result};
use std::net::Ipv4Addr;

// Message types
pub const BIND_REQUEST: u16 = 0x0001;
pub const BIND_RESPONSE: u16 = 0x0101;

// Attribute types
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;

// Address families
pub const FAMILY_IPV4: u8 = 0x01;
pub const FAMILY_IPV6: u8 = 0x02;

// CHANGE-REQUEST flags
pub const CHANGE_IP: u32 = 0x04;
pub const CHANGE_PORT: u32 = 0x02;

// STUN header: message type, body length, 128 bit transaction id
pub const HEADER_LEN: usize = 20;

/// Transport address carried by MAPPED-ADDRESS and friends.
/// Port and address are kept in host order; the wire uses network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttr {
    MappedAddress(StunAddress),
    SourceAddress(StunAddress),
    ChangedAddress(StunAddress),
    ChangeRequest(u32),
}

impl StunAttr {
    fn attr_type(&self) -> u16 {
        match self {
            StunAttr::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            StunAttr::SourceAddress(_) => ATTR_SOURCE_ADDRESS,
            StunAttr::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            StunAttr::ChangeRequest(_) => ATTR_CHANGE_REQUEST,
        }
    }
}

/// A STUN message: header plus an ordered TLV attribute sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub msg_type: u16,
    pub transaction_id: [u8; 16],
    pub attrs: Vec<StunAttr>,
}

impl StunMessage {
    /// Bind request, optionally asking the server to answer from a
    /// different ip and/or port.
    ///
    /// Transaction ids come from a plain prng; classification is not
    /// security sensitive.
    pub fn bind_request(change_ip: bool, change_port: bool) -> Self {
        let mut attrs = Vec::new();
        if change_ip || change_port {
            let mut flags = 0;
            if change_ip {
                flags |= CHANGE_IP;
            }
            if change_port {
                flags |= CHANGE_PORT;
            }
            attrs.push(StunAttr::ChangeRequest(flags));
        }

        Self {
            msg_type: BIND_REQUEST,
            transaction_id: rand::random(),
            attrs,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 12 * self.attrs.len());
        buf.extend_from_slice(&self.msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // body length, backpatched below
        buf.extend_from_slice(&self.transaction_id);

        for attr in &self.attrs {
            buf.extend_from_slice(&attr.attr_type().to_be_bytes());
            match attr {
                StunAttr::ChangeRequest(flags) => {
                    buf.extend_from_slice(&4u16.to_be_bytes());
                    buf.extend_from_slice(&flags.to_be_bytes());
                }
                StunAttr::MappedAddress(a)
                | StunAttr::SourceAddress(a)
                | StunAttr::ChangedAddress(a) => {
                    buf.extend_from_slice(&8u16.to_be_bytes());
                    buf.push(0); // pad
                    buf.push(FAMILY_IPV4);
                    buf.extend_from_slice(&a.port.to_be_bytes());
                    buf.extend_from_slice(&a.ip.octets());
                }
            }
        }

        let body_len = (buf.len() - HEADER_LEN) as u16;
        buf[2..4].copy_from_slice(&body_len.to_be_bytes());
        buf
    }

    /// Decode a message, never reading past the declared body length.
    /// Unknown attribute types are skipped.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Malformed("truncated header"));
        }

        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let mut transaction_id = [0u8; 16];
        transaction_id.copy_from_slice(&buf[4..HEADER_LEN]);

        if buf.len() - HEADER_LEN < body_len {
            return Err(Error::Malformed("truncated body"));
        }

        let body = &buf[HEADER_LEN..HEADER_LEN + body_len];
        let mut attrs = Vec::new();
        let mut at = 0;
        let mut size = body_len;

        while size > 0 {
            if size < 4 {
                return Err(Error::Malformed("dangling attribute header"));
            }

            let attr_type = u16::from_be_bytes([body[at], body[at + 1]]);
            let attr_len = u16::from_be_bytes([body[at + 2], body[at + 3]]) as usize;
            // values are padded to 4 byte boundaries
            let attr_pad = if attr_len % 4 == 0 { 0 } else { 4 - attr_len % 4 };
            if attr_len + attr_pad + 4 > size {
                return Err(Error::Malformed("attribute overruns message body"));
            }

            let value = &body[at + 4..at + 4 + attr_len];
            match attr_type {
                ATTR_MAPPED_ADDRESS => attrs.push(StunAttr::MappedAddress(decode_address(value)?)),
                ATTR_SOURCE_ADDRESS => attrs.push(StunAttr::SourceAddress(decode_address(value)?)),
                ATTR_CHANGED_ADDRESS => {
                    attrs.push(StunAttr::ChangedAddress(decode_address(value)?))
                }
                ATTR_CHANGE_REQUEST => {
                    if attr_len != 4 {
                        return Err(Error::Malformed("bad CHANGE-REQUEST length"));
                    }
                    attrs.push(StunAttr::ChangeRequest(u32::from_be_bytes([
                        value[0], value[1], value[2], value[3],
                    ])));
                }
                _ => {}
            }

            at += 4 + attr_len + attr_pad;
            size -= 4 + attr_len + attr_pad;
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attrs,
        })
    }

    pub fn mapped_address(&self) -> Option<StunAddress> {
        self.attrs.iter().find_map(|a| match a {
            StunAttr::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn changed_address(&self) -> Option<StunAddress> {
        self.attrs.iter().find_map(|a| match a {
            StunAttr::ChangedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn source_address(&self) -> Option<StunAddress> {
        self.attrs.iter().find_map(|a| match a {
            StunAttr::SourceAddress(addr) => Some(*addr),
            _ => None,
        })
    }
}

fn decode_address(value: &[u8]) -> Result<StunAddress> {
    // 8 bytes for ipv4, 20 for ipv6: pad, family, port, address
    if value.len() != 8 && value.len() != 20 {
        return Err(Error::Malformed("bad address attribute length"));
    }

    match value[1] {
        FAMILY_IPV4 if value.len() == 8 => Ok(StunAddress {
            port: u16::from_be_bytes([value[2], value[3]]),
            ip: Ipv4Addr::new(value[4], value[5], value[6], value[7]),
        }),
        FAMILY_IPV4 => Err(Error::Malformed("bad address attribute length")),
        FAMILY_IPV6 => Err(Error::UnsupportedFamily),
        _ => Err(Error::Malformed("unknown address family")),
    }
}
