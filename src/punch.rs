//! UDP hole punching.
//!
//! The simple strategy carves a NAT binding with a single low-TTL probe
//! at the peer's known endpoint. The symmetric-vs-symmetric strategy
//! cannot predict the peer's external port, so it races up to
//! [`MAX_CANDIDATES`] sockets across a shuffled slice of the ephemeral
//! range and keeps whichever one hears from the peer first.

use crate::error::{Error, Result};
use crate::proto::PeerInfo;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsFd;
use std::time::Duration;

pub const MIN_PORT: u16 = 1025;
pub const MAX_PORT: u16 = 65535;
pub const MAX_CANDIDATES: usize = 700;

/// Probe TTL. Large enough to cross our own NAT, small enough to die
/// before reaching the peer's, so probes don't trip its flood protection.
pub const PUNCH_TTL: u32 = 5;
/// TTL restored on a confirmed socket.
pub const DATA_TTL: u32 = 64;

pub const RACE_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE: &[u8] = b"c";
pub const CONFIRMATION: &[u8] = b"hello, peer";

#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// TTL for probe packets.
    pub ttl: u32,
    pub max_candidates: usize,
    pub race_timeout: Duration,
    /// Address candidate sockets bind to.
    pub local_ip: Ipv4Addr,
    /// Explicit candidate port list. When unset each attempt draws a
    /// fresh shuffle of the whole ephemeral range.
    pub ports: Option<Vec<u16>>,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            ttl: PUNCH_TTL,
            max_candidates: MAX_CANDIDATES,
            race_timeout: RACE_TIMEOUT,
            local_ip: Ipv4Addr::UNSPECIFIED,
            ports: None,
        }
    }
}

impl PunchConfig {
    pub(crate) fn port_sequence(&self, exclude: u16) -> PortSequence {
        match &self.ports {
            Some(ports) => PortSequence::new(ports.clone(), exclude),
            None => PortSequence::shuffled(exclude),
        }
    }
}

/// An owned candidate port permutation, consumed left to right. Each
/// punch attempt gets its own; nothing is shared between attempts.
pub struct PortSequence {
    ports: Vec<u16>,
    len: usize,
}

impl PortSequence {
    /// Fisher-Yates shuffle of the whole [`MIN_PORT`], [`MAX_PORT`] range.
    pub fn shuffled(exclude: u16) -> Self {
        use rand::seq::SliceRandom;

        let mut ports: Vec<u16> = (MIN_PORT..=MAX_PORT).collect();
        ports.shuffle(&mut rand::thread_rng());
        Self::with_exclusion(ports, exclude)
    }

    /// Explicitly passed port list, same exclusion rule.
    pub fn new(ports: Vec<u16>, exclude: u16) -> Self {
        Self::with_exclusion(ports, exclude)
    }

    /// The peer's already-known port is excluded by swapping it past the
    /// usable end, not by skipping it, so the consumable prefix stays
    /// hole free.
    fn with_exclusion(mut ports: Vec<u16>, exclude: u16) -> Self {
        let mut len = ports.len();
        if let Some(pos) = ports.iter().position(|&p| p == exclude) {
            len -= 1;
            ports.swap(pos, len);
        }
        Self { ports, len }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports[..self.len].iter().copied()
    }
}

/// Wait until one of `socks` is readable. Returns the lowest ready index,
/// or `None` once the timeout expires. A zero timeout makes this a pure
/// readiness check.
pub fn poll_ready(socks: &[UdpSocket], timeout: Duration) -> Result<Option<usize>> {
    let mut fds: Vec<PollFd> = socks
        .iter()
        .map(|s| PollFd::new(s.as_fd(), PollFlags::POLLIN))
        .collect();

    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let n = poll(&mut fds, PollTimeout::from(millis)).map_err(std::io::Error::from)?;
    if n == 0 {
        return Ok(None);
    }

    Ok(fds
        .iter()
        .position(|fd| fd.revents().map_or(false, |r| r.intersects(PollFlags::POLLIN))))
}

/// Race the candidate set to first response. The winner is moved out and
/// every other socket is closed before this returns, timeout included.
pub fn race(mut candidates: Vec<UdpSocket>, timeout: Duration) -> Result<Option<UdpSocket>> {
    if candidates.is_empty() {
        return Ok(None);
    }

    match poll_ready(&candidates, timeout)? {
        Some(index) => {
            let winner = candidates.swap_remove(index);
            drop(candidates);
            Ok(Some(winner))
        }
        None => Ok(None),
    }
}

/// Initiator side of the symmetric-vs-symmetric race.
///
/// Binds each candidate to a drawn local port and probes the peer at that
/// same port number, banking on NATs that preserve port numbers. `notify`
/// runs once the set is built, so the remote side starts probing back.
pub fn punch_symmetric<F>(
    peer: &PeerInfo,
    cfg: &PunchConfig,
    ports: PortSequence,
    notify: F,
) -> Result<Option<UdpSocket>>
where
    F: FnOnce() -> Result<()>,
{
    let candidates = open_candidates(peer, cfg, &ports)?;
    log::debug!("racing {} candidate sockets", candidates.len());

    notify()?;

    race(candidates, cfg.race_timeout)
}

/// Responder side. Same probing scheme, but the set is polled with a zero
/// timeout after every new socket so an already-arrived packet is adopted
/// as early as possible, with one final blocking wait as fallback.
pub fn punch_symmetric_responder(
    peer: &PeerInfo,
    cfg: &PunchConfig,
    ports: PortSequence,
) -> Result<Option<UdpSocket>> {
    let mut candidates: Vec<UdpSocket> = Vec::new();

    for port in ports.iter().take(cfg.max_candidates) {
        let sock = match bind_udp(SocketAddrV4::new(cfg.local_ip, port)) {
            Ok(sock) => sock,
            Err(_) => continue,
        };
        if probe(&sock, SocketAddrV4::new(peer.ip, port), cfg.ttl).is_err() {
            log::warn!(
                "probe failed after {} candidates, may have triggered flood protection",
                candidates.len()
            );
            break;
        }
        candidates.push(sock);

        if let Some(index) = poll_ready(&candidates, Duration::ZERO)? {
            let winner = candidates.swap_remove(index);
            drop(candidates);
            return Ok(Some(winner));
        }
    }

    race(candidates, cfg.race_timeout)
}

/// Simple strategy: one OS-bound socket, one low-TTL probe at the peer's
/// known endpoint, then wait for the peer's own probe to arrive.
pub fn punch_simple<F>(peer: &PeerInfo, cfg: &PunchConfig, notify: F) -> Result<Option<UdpSocket>>
where
    F: FnOnce() -> Result<()>,
{
    let sock = bind_udp(SocketAddrV4::new(cfg.local_ip, 0))?;
    probe(&sock, SocketAddrV4::new(peer.ip, peer.port), cfg.ttl)?;

    notify()?;

    race(vec![sock], cfg.race_timeout)
}

/// Handshake on a winning socket: read one datagram to learn the peer's
/// confirmed address, restore a normal TTL and answer with the
/// confirmation payload. The caller gets back an ordinary UDP path.
pub fn confirm(sock: &UdpSocket) -> Result<SocketAddr> {
    let mut buf = [0u8; 512];
    let (n, peer_addr) = sock.recv_from(&mut buf)?;
    log::info!("connected with peer at {} ({} byte hello)", peer_addr, n);

    sock.set_ttl(DATA_TTL)?;
    sock.send_to(CONFIRMATION, peer_addr)?;

    Ok(peer_addr)
}

fn open_candidates(
    peer: &PeerInfo,
    cfg: &PunchConfig,
    ports: &PortSequence,
) -> Result<Vec<UdpSocket>> {
    let mut candidates: Vec<UdpSocket> = Vec::new();

    for port in ports.iter().take(cfg.max_candidates) {
        // a locally taken port only shrinks the set
        let sock = match bind_udp(SocketAddrV4::new(cfg.local_ip, port)) {
            Ok(sock) => sock,
            Err(_) => continue,
        };

        if probe(&sock, SocketAddrV4::new(peer.ip, port), cfg.ttl).is_err() {
            // our own NAT refusing this many flows; race what we have
            log::warn!(
                "probe failed after {} candidates, may have triggered flood protection",
                candidates.len()
            );
            break;
        }

        candidates.push(sock);
    }

    if candidates.is_empty() {
        return Err(Error::ResourceExhausted("no candidate socket could be opened"));
    }

    Ok(candidates)
}

fn probe(sock: &UdpSocket, dst: SocketAddrV4, ttl: u32) -> Result<()> {
    sock.set_ttl(ttl)?;
    sock.set_write_timeout(Some(Duration::from_secs(5)))?;
    sock.send_to(PROBE, dst)?;
    Ok(())
}

fn bind_udp(local_addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(local_addr).into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::NatType;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::thread;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    #[test]
    fn shuffled_sequence_is_a_permutation() {
        let seq = PortSequence::shuffled(0);
        let ports: Vec<u16> = seq.iter().collect();
        assert_eq!(ports.len(), (MAX_PORT - MIN_PORT + 1) as usize);

        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
        assert!(ports.iter().all(|&p| (MIN_PORT..=MAX_PORT).contains(&p)));
    }

    #[test]
    fn known_peer_port_is_swapped_out_once() {
        let seq = PortSequence::shuffled(40000);
        let ports: Vec<u16> = seq.iter().collect();
        // one shorter, still duplicate free, and the excluded port is gone
        assert_eq!(ports.len(), (MAX_PORT - MIN_PORT) as usize);
        assert!(!ports.contains(&40000));
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn exclusion_swaps_instead_of_skipping() {
        let seq = PortSequence::new(vec![2000, 2001, 2002, 2003], 2001);
        assert_eq!(seq.iter().collect::<Vec<_>>(), vec![2000, 2003, 2002]);
    }

    #[test]
    fn absent_exclude_leaves_sequence_untouched() {
        let seq = PortSequence::new(vec![2000, 2001, 2002], 9);
        assert_eq!(seq.iter().collect::<Vec<_>>(), vec![2000, 2001, 2002]);
    }

    #[test]
    fn race_returns_the_readable_socket() {
        let candidates: Vec<UdpSocket> = (0..5)
            .map(|_| UdpSocket::bind((LOCALHOST, 0)).unwrap())
            .collect();
        let target = candidates[3].local_addr().unwrap();

        let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        sender.send_to(b"ping", target).unwrap();

        let winner = race(candidates, Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(winner.local_addr().unwrap(), target);

        let mut buf = [0u8; 16];
        let (n, _) = winner.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn race_times_out_with_no_traffic() {
        let candidates: Vec<UdpSocket> = (0..5)
            .map(|_| UdpSocket::bind((LOCALHOST, 0)).unwrap())
            .collect();
        let winner = race(candidates, Duration::from_millis(100)).unwrap();
        assert!(winner.is_none());
    }

    #[test]
    fn poll_ready_zero_timeout_is_immediate() {
        let socks = vec![UdpSocket::bind((LOCALHOST, 0)).unwrap()];
        assert_eq!(poll_ready(&socks, Duration::ZERO).unwrap(), None);

        let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        sender
            .send_to(b"x", socks[0].local_addr().unwrap())
            .unwrap();
        // give loopback delivery a moment
        thread::sleep(Duration::from_millis(20));
        assert_eq!(poll_ready(&socks, Duration::ZERO).unwrap(), Some(0));
    }

    #[test]
    fn simple_punch_wins_when_peer_answers() {
        let peer_sock = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let peer_addr = peer_sock.local_addr().unwrap();
        let peer = PeerInfo {
            ip: LOCALHOST,
            port: peer_addr.port(),
            nat_type: NatType::FullCone,
        };

        let echo = thread::spawn(move || {
            let mut buf = [0u8; 16];
            let (_, src) = peer_sock.recv_from(&mut buf).unwrap();
            peer_sock.send_to(b"hi", src).unwrap();
        });

        let cfg = PunchConfig {
            local_ip: LOCALHOST,
            race_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let won = punch_simple(&peer, &cfg, || Ok(())).unwrap();
        assert!(won.is_some());
        echo.join().unwrap();
    }

    #[test]
    fn confirm_answers_the_peer() {
        let winner = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let peer = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        peer.send_to(PROBE, winner.local_addr().unwrap()).unwrap();
        thread::sleep(Duration::from_millis(20));

        let confirmed = confirm(&winner).unwrap();
        assert_eq!(confirmed, peer.local_addr().unwrap());

        let mut buf = [0u8; 64];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], CONFIRMATION);
        assert_eq!(winner.ttl().unwrap(), DATA_TTL);
    }
}
