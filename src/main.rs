use natpunch::client::Client;
use natpunch::error::{Error, Result};
use natpunch::proto::PeerInfo;
use natpunch::punch::PunchConfig;
#[cfg(feature = "server")]
use natpunch::server::Server;
use natpunch::stun::Classifier;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "natpunch")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "stun-host", default_value = "stun.ekiga.net")]
    stun_host: String,

    #[structopt(long = "stun-port", default_value = "3478")]
    stun_port: u16,

    #[structopt(long = "local-ip", default_value = "0.0.0.0")]
    local_ip: Ipv4Addr,

    #[structopt(long = "local-port", default_value = "34780")]
    local_port: u16,

    /// punch server address
    #[structopt(long = "server-addr")]
    server_addr: String,

    /// peer id to connect to; without it, only enroll and wait
    #[structopt(long = "peer")]
    peer: Option<u32>,

    /// ttl of hole punching probes
    #[structopt(long = "ttl", default_value = "5")]
    ttl: u32,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:9988")]
    listen_addr: SocketAddr,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

#[cfg(feature = "server")]
fn run_server(opt: ServerOpt) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = Server::new(opt.listen_addr).await?;
        log::info!("punch server listening on {}", server.local_addr()?);
        server.run().await
    })?;
    Ok(())
}

#[cfg(not(feature = "server"))]
fn run_server(_opt: ServerOpt) -> Result<()> {
    Err(Error::Protocol("built without the server feature"))
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let classification = Classifier::new().classify(
        &opt.stun_host,
        opt.stun_port,
        SocketAddrV4::new(opt.local_ip, opt.local_port),
    )?;
    log::info!("NAT type: {}", classification.nat_type);

    let external = match classification.external {
        Some(external) => external,
        None => return Err(Error::Classification(classification.nat_type)),
    };
    log::info!("external address: {}", external);

    let info = PeerInfo {
        ip: *external.ip(),
        port: external.port(),
        nat_type: classification.nat_type,
    };
    let cfg = PunchConfig {
        ttl: opt.ttl,
        local_ip: opt.local_ip,
        ..Default::default()
    };

    let mut client = Client::new(&opt.server_addr, info, cfg)?;
    let id = client.enroll()?;
    log::info!("enrolled with id {}", id);

    if let Some(peer_id) = opt.peer {
        log::info!("connecting to peer {}", peer_id);
        let tunnel = client.connect_to_peer(peer_id)?;
        log::info!("tunnel up, peer at {}", tunnel.peer_addr);
    }

    let (listener, tunnels) = client.into_listener()?;
    for tunnel in tunnels.iter() {
        log::info!("tunnel up, peer at {}", tunnel.peer_addr);
    }

    // the channel only closes once the session stream does
    listener.shutdown();
    Ok(())
}
