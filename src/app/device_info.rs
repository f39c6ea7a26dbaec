//! Peer capability records.
//!
//! A transaction sizes its segments and validates segment counts against what it knows
//! about the peer. That knowledge comes from I-Am, from the application, or from live
//! confirmed requests, and is shared by every transaction through [`DeviceInfoCache`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::app::{MaxApduSize, MaxSegments};
use crate::network::NetworkAddress;
use crate::service::ServiceError;

/// Segmentation support enumeration (BACnetSegmentation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    #[default]
    NoSegmentation = 3,
}

impl Segmentation {
    /// Device can send segmented messages
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    /// Device can receive segmented messages
    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }

    /// Same support plus the ability to receive
    pub fn with_receive(self) -> Self {
        match self {
            Segmentation::NoSegmentation => Segmentation::Receive,
            Segmentation::Transmit => Segmentation::Both,
            other => other,
        }
    }
}

impl TryFrom<u8> for Segmentation {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            _ => Err(ServiceError::InvalidEnumeration(value)),
        }
    }
}

impl fmt::Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segmentation::Both => "segmented-both",
            Segmentation::Transmit => "segmented-transmit",
            Segmentation::Receive => "segmented-receive",
            Segmentation::NoSegmentation => "no-segmentation",
        };
        f.write_str(name)
    }
}

/// What is known about a peer device's application layer
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub device_instance: Option<u32>,
    pub max_apdu_length_accepted: MaxApduSize,
    pub segmentation_supported: Segmentation,
    pub max_segments_accepted: MaxSegments,
    /// Largest NPDU the path to the peer carries, when a router told us
    pub max_npdu_length: Option<usize>,
    pub vendor_id: Option<u16>,
}

impl DeviceInfo {
    pub fn new(max_apdu_length_accepted: MaxApduSize, segmentation_supported: Segmentation) -> Self {
        Self {
            device_instance: None,
            max_apdu_length_accepted,
            segmentation_supported,
            max_segments_accepted: MaxSegments::Unspecified,
            max_npdu_length: None,
            vendor_id: None,
        }
    }

    pub fn with_device_instance(mut self, instance: u32) -> Self {
        self.device_instance = Some(instance);
        self
    }

    pub fn with_max_segments(mut self, max_segments: MaxSegments) -> Self {
        self.max_segments_accepted = max_segments;
        self
    }

    pub fn with_max_npdu_length(mut self, length: usize) -> Self {
        self.max_npdu_length = Some(length);
        self
    }

    pub fn with_vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    /// Largest service payload that reaches the peer in one piece
    pub fn deliverable_size(&self) -> usize {
        let apdu = self.max_apdu_length_accepted.size();
        self.max_npdu_length.map_or(apdu, |npdu| npdu.min(apdu))
    }
}

/// Shared peer capability cache keyed by network address
#[derive(Debug, Clone, Default)]
pub struct DeviceInfoCache {
    devices: Arc<RwLock<HashMap<NetworkAddress, DeviceInfo>>>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &NetworkAddress) -> Option<DeviceInfo> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(address).cloned()
    }

    /// Insert or replace the record for `address`
    pub fn update(&self, address: NetworkAddress, info: DeviceInfo) {
        log::debug!(
            "device info {}: max apdu {}, {}",
            address,
            info.max_apdu_length_accepted.size(),
            info.segmentation_supported
        );
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.insert(address, info);
    }

    pub fn remove(&self, address: &NetworkAddress) -> Option<DeviceInfo> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices.remove(address)
    }

    /// Record that the peer accepts segmented responses
    ///
    /// Read, upgrade and write happen under one write guard. Returns the updated record,
    /// or `None` when nothing is known about the peer.
    pub fn note_segmented_response_accepted(&self, address: &NetworkAddress) -> Option<DeviceInfo> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let info = devices.get_mut(address)?;
        let upgraded = info.segmentation_supported.with_receive();
        if upgraded != info.segmentation_supported {
            log::debug!(
                "device info {}: segmentation {} -> {}",
                address,
                info.segmentation_supported,
                upgraded
            );
            info.segmentation_supported = upgraded;
        }
        Some(info.clone())
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
