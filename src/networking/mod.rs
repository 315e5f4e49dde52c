pub mod discovery;
pub mod interface;
pub mod protocol;
pub mod file_transfer;

// Re-export key components for easier access
pub use discovery::{
    BackendEvent, DiscoveryCallback, DiscoveryEvent, MdnsBackend, PeerDiscovery, PeerRecord,
    ServiceBackend, ServiceRegistration,
};
pub use file_transfer::{
    FileSource, FileTransferConfig, FileTransferManager, OpenedSource, PathSource, SendTask,
    StatusCallback, TransferDirection, TransferStatus,
};
pub use protocol::{ProtocolError, TransferMetadata};
