//!NAT type detection and UDP hole punching through a rendezvous ("punch") server.
//!
//!To reach a node behind NAT you need two things: its externally visible
//!address, and a NAT binding that lets your packets in. This crate covers both.
//!The [`stun`] module speaks the classic STUN test sequence against a
//!CHANGE-REQUEST capable server to find the external address and classify the
//!NAT's filtering and mapping behavior. The [`client`] module keeps a session
//!with a punch server where peers enroll their address and classification
//!under a server-assigned numeric id, and drives the hole punching in the
//![`punch`] module.
//!
//!For the easy NAT types one low-TTL probe at the peer's known endpoint is
//!enough. When both sides sit behind symmetric NAT the external ports are
//!unpredictable, so both sides race several hundred sockets across a shuffled
//!slice of the ephemeral range and keep the first one the peer's probes reach.
//!The confirmed socket is handed back as a plain [`std::net::UdpSocket`].
//!
//!IPv4 only, matching what symmetric NAT traversal is actually needed for;
//!there is no relay fallback when no hole can be punched.
//!
//!## Feature flags
//!The crate includes the client and the punch server by default. Set
//!features to `client` or `server` if you only need one side.
//!
//!```toml
//!natpunch = { version = "0.1", default-features = false, features = ["client"] }
//!```
//!
//!- `client`: NAT classifier, punch-server session, hole-punch engine
//!- `server`: tokio based punch server

pub mod error;
pub mod proto;
pub mod stun;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod punch;

#[cfg(feature = "server")]
pub mod server;
