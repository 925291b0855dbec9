//! Network layer: wire framing, message codecs, per-peer connections, the
//! peer-group fleet manager, Bloom filters, discovery, and the chain
//! downloader built on top of all of them.

pub mod bloom;
pub mod discovery;
pub mod downloader;
pub mod group;
pub mod messages;
pub mod peer;
pub mod wire;

pub use bloom::{BloomFilter, BloomUpdateFlag};
pub use discovery::{DiscoveryError, DnsSeedSource};
pub use downloader::{Downloader, FilterWatcher, NullFilterWatcher};
pub use group::{BroadcastOutcome, PeerGroupHandle};
pub use messages::{NetworkMessage, WireMessage};
pub use peer::{PeerError, PeerEvent, PeerHandle, PeerId, PeerState};
pub use wire::WireError;
