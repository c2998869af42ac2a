//! Punch (rendezvous) server.
//!
//! Tracks every enrolled peer's external address and NAT type, answers
//! lookups, and forwards connection requests by pushing the requester's
//! record down the target's session.

use crate::proto::{self, PeerInfo, Request, OFFLINE, PEER_INFO_LEN};
use std::collections::HashMap;
use std::io::{Error, ErrorKind::Other, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{ReadHalf, WriteHalf},
        TcpListener, ToSocketAddrs,
    },
    select,
    sync::mpsc::{channel, Receiver, Sender},
    task,
};

pub struct Server {
    listener: TcpListener,
    peers: PeerMap,
    count: u32,
}

#[derive(Clone)]
struct PeerState {
    info: PeerInfo,
    event_tx: Sender<Event>,
}

type PeerMap = Arc<Mutex<HashMap<u32, PeerState>>>;

enum Event {
    /// request read from the peer's own stream
    Req(Request),
    /// another session asking us to push its record to this peer
    Push(PeerInfo),
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;

        Ok(Self {
            listener,
            peers: Default::default(),
            count: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Ids are assigned per connection and never reused within a server's
    /// lifetime; clients learn theirs from the enroll reply.
    fn next_id(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let (mut stream, addr) = self.listener.accept().await?;
            let conn_id = self.next_id();
            let peers = self.peers.clone();

            task::spawn(async move {
                log::debug!("connection {} from {}", conn_id, addr);

                let (event_tx, event_rx) = channel(10);
                let (r, w) = stream.split();
                let h = PeerHandler {
                    stream: w,
                    peers,
                    conn_id,
                    enrolled: false,
                    event_tx,
                };

                h.handle_stream(r, event_rx).await;
            });
        }
    }
}

struct PeerHandler<'a> {
    stream: WriteHalf<'a>,
    peers: PeerMap,
    conn_id: u32,
    enrolled: bool,
    event_tx: Sender<Event>,
}

impl<'a> PeerHandler<'a> {
    async fn handle_stream(mut self, r: ReadHalf<'a>, mut event_rx: Receiver<Event>) {
        let event_tx = self.event_tx.clone();

        select! {
            _ = Self::read_reqs(r, event_tx) => {}
            _ = self.handle_events(&mut event_rx) => {}
        }

        if self.enrolled {
            self.peers.lock().unwrap().remove(&self.conn_id);
            log::debug!("peer {} disconnected", self.conn_id);
        }
    }

    async fn read_reqs(mut r: ReadHalf<'a>, event_tx: Sender<Event>) -> Result<()> {
        loop {
            let req = read_request(&mut r).await?;
            event_tx
                .send(Event::Req(req))
                .await
                .map_err(|_| Error::new(Other, "event channel closed"))?;
        }
    }

    async fn handle_events(&mut self, event_rx: &mut Receiver<Event>) -> Result<()> {
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Req(Request::Enroll(info)) => self.handle_enroll(info).await?,
                Event::Req(Request::GetPeerInfo(id)) => self.handle_get_peer_info(id).await?,
                Event::Req(Request::NotifyPeer(id)) => self.handle_notify(id).await?,
                Event::Push(info) => self.stream.write_all(&info.encode()).await?,
            }
        }

        Err(Error::new(Other, "event channel closed"))
    }

    async fn handle_enroll(&mut self, info: PeerInfo) -> Result<()> {
        log::info!(
            "peer {} enrolled: {}:{}, nat type: {}",
            self.conn_id,
            info.ip,
            info.port,
            info.nat_type
        );

        self.peers.lock().unwrap().insert(
            self.conn_id,
            PeerState {
                info,
                event_tx: self.event_tx.clone(),
            },
        );
        self.enrolled = true;

        self.stream.write_all(&self.conn_id.to_be_bytes()).await
    }

    async fn handle_get_peer_info(&mut self, peer_id: u32) -> Result<()> {
        let state = self.peers.lock().unwrap().get(&peer_id).cloned();

        match state {
            Some(state) => self.stream.write_all(&state.info.encode()).await,
            None => {
                log::debug!("peer {} not found", peer_id);
                self.stream.write_all(&[OFFLINE]).await
            }
        }
    }

    async fn handle_notify(&mut self, peer_id: u32) -> Result<()> {
        log::debug!("notify {} -> {}", self.conn_id, peer_id);

        let own = self.peers.lock().unwrap().get(&self.conn_id).map(|s| s.info);
        let own = match own {
            Some(info) => info,
            None => return Err(Error::new(Other, "notify before enroll")),
        };

        let target = self.peers.lock().unwrap().get(&peer_id).cloned();
        match target {
            Some(target) => {
                let _ = target.event_tx.send(Event::Push(own)).await;
            }
            None => log::debug!("notify target {} offline", peer_id),
        }

        Ok(())
    }
}

async fn read_request(r: &mut ReadHalf<'_>) -> Result<Request> {
    let mut tag = [0u8; 2];
    r.read_exact(&mut tag).await?;

    match u16::from_be_bytes(tag) {
        proto::ENROLL => {
            let mut buf = [0u8; PEER_INFO_LEN];
            r.read_exact(&mut buf).await?;
            PeerInfo::decode(&buf)
                .map(Request::Enroll)
                .map_err(|e| Error::new(Other, e))
        }
        proto::GET_PEER_INFO => Ok(Request::GetPeerInfo(r.read_u32().await?)),
        proto::NOTIFY_PEER => Ok(Request::NotifyPeer(r.read_u32().await?)),
        _ => Err(Error::new(Other, "unknown request tag")),
    }
}
