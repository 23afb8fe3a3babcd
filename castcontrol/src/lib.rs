//! # castcontrol - the casting control plane
//!
//! Discovers DLNA/UPnP renderers over SSDP, reconciles the observed
//! fleet against the desired state held by `castconfig`, and drives each
//! renderer through AVTransport SOAP with a per-device loop monitor so
//! that every assigned video keeps playing.

pub mod avtransport;
pub mod description;
pub mod device;
pub mod manager;
pub mod overlay;
pub mod renderer;
pub mod soap;
pub mod ssdp;
pub mod transcreen;

pub use avtransport::{AvTransportClient, PositionInfo, TransportInfo};
pub use description::{DescriptionError, DeviceDescription, resolve_control_url};
pub use device::{Device, DeviceInfo, DeviceStatus};
pub use manager::{
    ControlMode, DeviceManager, DiscoveryStatus, PlaybackStats, ProgressStore,
};
pub use renderer::{MediaItem, RendererBackend, RendererDriver};
pub use soap::invoke_upnp_action;
pub use ssdp::SsdpResponse;
pub use transcreen::TranscreenClient;
