//! Local-network file sharing.
//!
//! Two independent pieces: [`networking::PeerDiscovery`] advertises this
//! device over mDNS and reports peers offering the same service, and
//! [`networking::FileTransferManager`] moves one file per TCP connection
//! using a length-prefixed metadata header.

pub mod config;
pub mod networking;

pub use config::ShareConfig;
