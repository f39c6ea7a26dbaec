#![doc = include_str!("../README.md")]

pub mod app;
#[cfg(feature = "async")]
pub mod datalink;
pub mod network;
pub mod service;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::{
    Apdu, ApplicationConfig, ApplicationError, ClientSsm, Pdu, SapAction, ServerSsm,
    SsmState, StateMachineAccessPoint,
};
#[cfg(feature = "async")]
pub use datalink::{BipDataLink, DataLink};
pub use network::NetworkAddress;
pub use service::{ConfirmedServiceChoice, ServiceError, UnconfirmedServiceChoice};

#[doc(hidden)]
pub use pastey;

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
