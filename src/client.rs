//! Punch-server session and peer connection orchestration.
//!
//! A [`Client`] keeps one persistent TCP session to the punch server:
//! enroll once, then either ask to connect to a named peer or turn the
//! session into a background notify listener that answers incoming
//! connection requests with the responder hole-punch procedure.

use crate::error::{Error, Result};
use crate::proto::{PeerInfo, Request, PEER_INFO_LEN};
use crate::punch;
use crate::punch::PunchConfig;
use crate::stun::NatType;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

/// A punched UDP path, connected to the confirmed peer address.
#[derive(Debug)]
pub struct Tunnel {
    pub socket: UdpSocket,
    pub peer_addr: SocketAddr,
}

pub struct Client {
    stream: TcpStream,
    info: PeerInfo,
    id: Option<u32>,
    cfg: PunchConfig,
    op_timeout: Duration,
}

impl Client {
    /// Connect the session. `info` is this side's external address and
    /// NAT type as classification reported them.
    pub fn new(server_addr: &str, info: PeerInfo, cfg: PunchConfig) -> Result<Self> {
        let server_addr = server_addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::Protocol("punch server name resolve fail"))?;
        let stream = TcpStream::connect(server_addr)?;

        Ok(Self {
            stream,
            info,
            id: None,
            cfg,
            op_timeout: Duration::from_secs(5),
        })
    }

    /// Server assigned id, set once enrollment completes.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn set_op_timeout(&mut self, op_timeout: Duration) {
        self.op_timeout = op_timeout;
    }

    /// Register this side's address and NAT type, returning the id the
    /// server assigned. A short or absent reply fails the enrollment.
    pub fn enroll(&mut self) -> Result<u32> {
        self.stream.write_all(&Request::Enroll(self.info).encode())?;

        let mut buf = [0u8; 4];
        self.read_reply(&mut buf).map_err(|e| match e {
            Error::Timeout => Error::EnrollFailed,
            other => other,
        })?;

        let id = u32::from_be_bytes(buf);
        self.id = Some(id);
        Ok(id)
    }

    /// Look up a peer's record. A short or absent reply means the peer
    /// is not enrolled.
    pub fn get_peer_info(&mut self, peer_id: u32) -> Result<PeerInfo> {
        self.stream
            .write_all(&Request::GetPeerInfo(peer_id).encode())?;

        let mut buf = [0u8; PEER_INFO_LEN];
        self.read_reply(&mut buf).map_err(|e| match e {
            Error::Timeout => Error::PeerOffline,
            other => other,
        })?;

        PeerInfo::decode(&buf)
    }

    /// Ask the server to push our record to `peer_id`. No direct reply.
    pub fn notify_peer(&mut self, peer_id: u32) -> Result<()> {
        self.stream
            .write_all(&Request::NotifyPeer(peer_id).encode())?;
        Ok(())
    }

    /// Fetch the peer's record and drive the strategy for our NAT type
    /// pair. Only the symmetric/symmetric initiator is implemented; the
    /// remaining pairs are open strategy slots, reported as unsupported
    /// rather than guessed at.
    pub fn connect_to_peer(&mut self, peer_id: u32) -> Result<Tunnel> {
        let peer = self.get_peer_info(peer_id)?;
        log::info!(
            "peer {} at {}:{}, nat type: {}",
            peer_id,
            peer.ip,
            peer.port,
            peer.nat_type
        );

        match (self.info.nat_type, peer.nat_type) {
            (NatType::Symmetric, NatType::Symmetric) => {
                let cfg = self.cfg.clone();
                let ports = cfg.port_sequence(peer.port);
                let won =
                    punch::punch_symmetric(&peer, &cfg, ports, || self.notify_peer(peer_id))?;

                let socket = won.ok_or(Error::Timeout)?;
                let peer_addr = punch::confirm(&socket)?;
                socket.connect(peer_addr)?;
                Ok(Tunnel { socket, peer_addr })
            }
            (local, peer) => Err(Error::UnsupportedPeerNat { local, peer }),
        }
    }

    /// Turn the session into a background notify listener. Each pushed
    /// peer record triggers the responder hole-punch procedure; confirmed
    /// tunnels are delivered on the returned channel. Consumes the
    /// session so foreground requests can no longer interleave with
    /// asynchronous pushes on the shared stream.
    pub fn into_listener(self) -> Result<(NotifyListener, Receiver<Tunnel>)> {
        let stream = self.stream.try_clone()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let cfg = self.cfg.clone();
        let flag = shutdown.clone();
        let session = self.stream;
        let handle = spawn(move || notify_loop(session, cfg, flag, tx));

        Ok((
            NotifyListener {
                stream,
                shutdown,
                handle,
            },
            rx,
        ))
    }

    fn read_reply(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.set_read_timeout(Some(self.op_timeout))?;
        self.stream.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::UnexpectedEof => {
                Error::Timeout
            }
            _ => Error::Socket(e),
        })
    }
}

/// Handle on the background listener thread. Dropping it leaves the
/// thread running for the life of the process; [`shutdown`] stops and
/// joins it.
///
/// [`shutdown`]: NotifyListener::shutdown
pub struct NotifyListener {
    stream: TcpStream,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl NotifyListener {
    /// Signal the listener and join it. Shutting the stream down unblocks
    /// the pending read.
    pub fn shutdown(self) {
        self.shutdown.store(true, Relaxed);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = self.handle.join();
    }
}

fn notify_loop(
    mut stream: TcpStream,
    cfg: PunchConfig,
    shutdown: Arc<AtomicBool>,
    tx: Sender<Tunnel>,
) {
    // pushes can be days apart, block without a deadline
    if stream.set_read_timeout(None).is_err() {
        return;
    }

    log::info!("waiting for connection requests");
    loop {
        if shutdown.load(Relaxed) {
            break;
        }

        let mut buf = [0u8; PEER_INFO_LEN];
        if let Err(e) = stream.read_exact(&mut buf) {
            if !shutdown.load(Relaxed) {
                log::debug!("session stream closed: {}", e);
            }
            break;
        }

        let peer = match PeerInfo::decode(&buf) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("ignoring malformed notify push: {}", e);
                continue;
            }
        };
        log::info!(
            "connection request from {}:{}, nat type: {}",
            peer.ip,
            peer.port,
            peer.nat_type
        );

        let ports = cfg.port_sequence(peer.port);
        match punch::punch_symmetric_responder(&peer, &cfg, ports) {
            Ok(Some(socket)) => match punch::confirm(&socket) {
                Ok(peer_addr) => {
                    if let Err(e) = socket.connect(peer_addr) {
                        log::warn!("connect to {} failed: {}", peer_addr, e);
                        continue;
                    }
                    let _ = tx.send(Tunnel { socket, peer_addr });
                }
                Err(e) => log::warn!("handshake failed: {}", e),
            },
            Ok(None) => log::warn!("hole punch timed out, no candidate heard back"),
            Err(e) => log::warn!("hole punch failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn info(nat_type: NatType) -> PeerInfo {
        PeerInfo {
            ip: LOCALHOST,
            port: 40001,
            nat_type,
        }
    }

    fn quick_client(server_addr: SocketAddr, nat_type: NatType) -> Client {
        let mut c = Client::new(
            &server_addr.to_string(),
            info(nat_type),
            PunchConfig::default(),
        )
        .unwrap();
        c.set_op_timeout(Duration::from_millis(200));
        c
    }

    /// One-connection mock punch server that answers every request with
    /// a canned byte string.
    fn mock_server(replies: Vec<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for reply in replies {
                let mut buf = [0u8; 64];
                if stream.read(&mut buf).is_err() {
                    return;
                }
                let _ = stream.write_all(&reply);
            }
            // hold the connection open so reads time out instead of EOF
            thread::sleep(Duration::from_secs(2));
        });
        addr
    }

    #[test]
    fn enroll_decodes_assigned_id() {
        let addr = mock_server(vec![0x00000539u32.to_be_bytes().to_vec()]);
        let mut client = quick_client(addr, NatType::Symmetric);
        assert_eq!(client.enroll().unwrap(), 1337);
        assert_eq!(client.id(), Some(1337));
    }

    #[test]
    fn short_enroll_reply_fails() {
        let addr = mock_server(vec![vec![0x00, 0x01]]);
        let mut client = quick_client(addr, NatType::Symmetric);
        assert!(matches!(client.enroll(), Err(Error::EnrollFailed)));
    }

    #[test]
    fn short_peer_info_reply_means_offline() {
        // the offline marker is a single zero byte
        let addr = mock_server(vec![vec![0x00]]);
        let mut client = quick_client(addr, NatType::Symmetric);
        assert!(matches!(
            client.get_peer_info(9),
            Err(Error::PeerOffline)
        ));
    }

    #[test]
    fn get_peer_info_decodes_record() {
        let addr = mock_server(vec![info(NatType::FullCone).encode().to_vec()]);
        let mut client = quick_client(addr, NatType::Symmetric);
        assert_eq!(client.get_peer_info(9).unwrap(), info(NatType::FullCone));
    }

    #[test]
    fn unimplemented_nat_pair_is_reported() {
        let addr = mock_server(vec![info(NatType::FullCone).encode().to_vec()]);
        let mut client = quick_client(addr, NatType::Symmetric);
        assert!(matches!(
            client.connect_to_peer(9),
            Err(Error::UnsupportedPeerNat {
                local: NatType::Symmetric,
                peer: NatType::FullCone,
            })
        ));
    }

    #[cfg(feature = "server")]
    mod end_to_end {
        use super::*;
        use crate::server::Server;

        const LOCALHOST2: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

        fn punch_cfg(local_ip: Ipv4Addr, ports: &[u16]) -> PunchConfig {
            PunchConfig {
                local_ip,
                ports: Some(ports.to_vec()),
                max_candidates: ports.len(),
                ..Default::default()
            }
        }

        /// Two symmetric peers on distinct loopback addresses, explicit
        /// overlapping candidate ports standing in for a deterministic
        /// NAT mapping. A initiates, B answers from its notify listener,
        /// both must end up on one tunnel and see the confirmation
        /// payload.
        #[test]
        fn two_symmetric_peers_converge_on_one_tunnel() {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let server = rt.block_on(Server::new("127.0.0.1:0")).unwrap();
            let server_addr = server.local_addr().unwrap().to_string();
            rt.spawn(server.run());

            let ports: Vec<u16> = (45801..45809).collect();

            let mut a = Client::new(
                &server_addr,
                PeerInfo {
                    ip: LOCALHOST,
                    port: 40001,
                    nat_type: NatType::Symmetric,
                },
                punch_cfg(LOCALHOST, &ports),
            )
            .unwrap();
            let mut b = Client::new(
                &server_addr,
                PeerInfo {
                    ip: LOCALHOST2,
                    port: 40002,
                    nat_type: NatType::Symmetric,
                },
                punch_cfg(LOCALHOST2, &ports),
            )
            .unwrap();

            a.enroll().unwrap();
            let b_id = b.enroll().unwrap();

            let (listener, tunnels) = b.into_listener().unwrap();

            let tunnel_a = a.connect_to_peer(b_id).unwrap();
            let tunnel_b = tunnels.recv_timeout(Duration::from_secs(15)).unwrap();

            assert_eq!(tunnel_b.peer_addr.ip(), LOCALHOST);
            assert_eq!(tunnel_a.peer_addr.ip(), LOCALHOST2);

            // B's confirm answered A's confirmation; A observes it as
            // ordinary traffic on the connected socket.
            tunnel_a
                .socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 64];
            let n = tunnel_a.socket.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], punch::CONFIRMATION);

            listener.shutdown();
        }
    }
}
