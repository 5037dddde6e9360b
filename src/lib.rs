//! Google Cast device discovery and control-channel monitoring.
//!
//! The crate reconciles an mDNS/DNS-SD discovery feed into a stable device
//! table, opens authenticated TLS control channels to devices on demand,
//! tracks their receiver/application/media/volume state and publishes every
//! change on a single event stream. An RPC adapter mirrors the same stream
//! and the device table to remote consumers.
//!
//! - [`CastManager`] owns the device and channel tables and the event stream
//! - [`CastChannel`] speaks the CASTv2 framing to one device
//! - [`MdnsDiscovery`] implements the [`DiscoverySource`] the manager needs
//! - [`rpc::CastService`] / [`rpc::CastClient`] bridge the stream over TCP
//!
//! The crate never installs a logger; embedders configure the `log` facade.

pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod event;
pub mod manager;
pub mod rpc;
pub mod status;

pub use channel::CastChannel;
pub use codec::CastMessage;
pub use config::CastConfig;
pub use device::{CastDevice, Family};
pub use discovery::{
    DiscoveryEvent, DiscoveryEventKind, DiscoverySource, MdnsDiscovery, ServiceRecord,
};
pub use error::CastError;
pub use event::{CastEvent, ChannelEvent, EventKind};
pub use manager::CastManager;
pub use status::{Application, MediaInformation, MediaSession, Namespace, Volume};
