pub mod bus;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metadata;
pub mod types;
pub mod wire;

pub use bus::{
    Bus, BusError, BusEvent, CallError, Connection, IncomingCall, Message, PeerId, PeerInfo,
    PendingCall, ReplyHandle, ServiceEndpoint,
};
pub use config::{ConfigError, NimbusConfig};
pub use credentials::Credentials;
pub use error::{ErrorKind, Result, StorageError, WireError};
pub use types::{Item, ItemMetadata, ItemType, MetadataValue};
pub use wire::{Call, ReplyBody};
