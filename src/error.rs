use crate::stun::NatType;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// No response within the configured window. Mostly a signal
    /// (Blocked NAT, no hole punched), not a fault.
    #[error("timed out waiting for a response")]
    Timeout,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("unsupported address family")]
    UnsupportedFamily,

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Local bind address already in use.
    #[error("local port unavailable")]
    PortUnavailable,

    /// Classification finished without a usable external address.
    #[error("NAT classification failed: {0}")]
    Classification(NatType),

    #[error("punch server rejected enrollment or did not reply")]
    EnrollFailed,

    #[error("peer is offline")]
    PeerOffline,

    /// Candidate creation cut short before any socket could be opened.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("unsupported NAT type combination: local {local}, peer {peer}")]
    UnsupportedPeerNat { local: NatType, peer: NatType },
}
