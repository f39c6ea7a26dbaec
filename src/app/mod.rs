//! BACnet Application Layer Module
//!
//! This module implements the application layer of a BACnet device: the APDU codec and
//! the transaction state machines that carry confirmed services across the network.
//!
//! # Overview
//!
//! The application layer handles:
//! - APDU formation and parsing
//! - Segmentation of service data that does not fit in one APDU, under a sliding window
//! - Per-transaction state, retries and timeouts ([`client::ClientSsm`], [`server::ServerSsm`])
//! - Invoke ID allocation, demultiplexing and device communication control
//!   ([`sap::StateMachineAccessPoint`])
//!
//! The state machines are sans-IO: they consume PDUs and timer expiries and return
//! [`sap::SapAction`]s. With the `async` feature, [`runtime`] drives an access point from a
//! single tokio task.
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! # Example
//!
//! ```
//! use bacnet_appservice::app::*;
//! use bacnet_appservice::service::UnconfirmedServiceChoice;
//! use bytes::Bytes;
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: UnconfirmedServiceChoice::WhoIs,
//!     service_data: Bytes::new(),
//! };
//! assert_eq!(apdu.encode(), vec![0x10, 0x08]);
//! ```

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::network::NetworkAddress;
use crate::service::{
    AbortReason, ConfirmedServiceChoice, EnableDisable, RejectReason, UnconfirmedServiceChoice,
};

pub mod client;
pub mod device_info;
pub mod sap;
pub mod server;
pub mod ssm;

#[cfg(feature = "async")]
pub mod runtime;
#[cfg(feature = "async")]
pub mod timer;

pub use client::ClientSsm;
pub use device_info::{DeviceInfo, DeviceInfoCache, Segmentation};
pub use sap::{Role, SapAction, StateMachineAccessPoint, TransactionKey};
pub use server::ServerSsm;
pub use ssm::{SegmentationContext, SsmAction, SsmState};

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    /// Invalid APDU format, or an APDU that cannot be used where it was supplied
    #[error("Invalid APDU: {0}")]
    InvalidApdu(String),
    /// Unsupported APDU type
    #[error("Unsupported APDU type: {0}")]
    UnsupportedApduType(u8),
    /// Transition attempted out of a terminal state
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SsmState, to: SsmState },
    /// Segment index beyond the segment count
    #[error("Segment index {index} out of range (segment count {count})")]
    IndexOutOfRange { index: usize, count: usize },
    /// Operation needs a segmentation context that was never set
    #[error("No segmentation context")]
    NoSegmentationContext,
    /// Every invoke ID is in use for the peer
    #[error("No available invoke ID for {0}")]
    NoAvailableInvokeId(NetworkAddress),
    /// Invoke ID already bound to a live client transaction
    #[error("Invoke ID {invoke_id} already in use for {peer}")]
    InvokeIdInUse { invoke_id: u8, peer: NetworkAddress },
    /// APDU kind not valid in the transaction's current state
    #[error("Unexpected {apdu:?} APDU in state {state}")]
    UnexpectedApdu { apdu: ApduType, state: SsmState },
    /// PDU lacks the address needed to route it
    #[error("PDU has no {0} address")]
    MissingAddress(&'static str),
    /// The application service is no longer running
    #[error("Application service unavailable")]
    ServiceUnavailable,
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(ApplicationError::UnsupportedApduType(other)),
        }
    }
}

bitflags! {
    /// Segmentation flags in the first octet of Confirmed-Request and Complex-ACK PDUs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PduFlags: u8 {
        const SEGMENTED = 0x08;
        const MORE_FOLLOWS = 0x04;
        /// Confirmed-Request only
        const SEGMENTED_RESPONSE_ACCEPTED = 0x02;
    }
}

bitflags! {
    /// Flags in the first octet of Segment-ACK and Abort PDUs
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AckFlags: u8 {
        /// Segment-ACK only
        const NEGATIVE = 0x02;
        const SERVER = 0x01;
    }
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: ConfirmedServiceChoice,
        service_data: Bytes,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: UnconfirmedServiceChoice,
        service_data: Bytes,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Bytes,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u16,
        error_code: u16,
    },

    /// Reject PDU
    Reject {
        invoke_id: u8,
        reject_reason: RejectReason,
    },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: AbortReason,
    },
}

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxSegments {
    #[default]
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Number of segments, `None` when the peer did not put a bound on it
    pub fn count(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }

    /// Largest encoding that does not exceed `count`
    pub fn from_count(count: usize) -> Self {
        match count {
            0 | 1 => MaxSegments::Unspecified,
            2..=3 => MaxSegments::Two,
            4..=7 => MaxSegments::Four,
            8..=15 => MaxSegments::Eight,
            16..=31 => MaxSegments::Sixteen,
            32..=63 => MaxSegments::ThirtyTwo,
            64 => MaxSegments::SixtyFour,
            _ => MaxSegments::GreaterThan64,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Largest encoding that does not exceed `size` octets
    pub fn from_size(size: usize) -> Self {
        match size {
            0..=127 => MaxApduSize::Up50,
            128..=205 => MaxApduSize::Up128,
            206..=479 => MaxApduSize::Up206,
            480..=1023 => MaxApduSize::Up480,
            1024..=1475 => MaxApduSize::Up1024,
            _ => MaxApduSize::Up1476,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }
}

impl Apdu {
    /// Abort PDU; `server` is true when the responding device aborts
    pub fn abort(server: bool, invoke_id: u8, abort_reason: AbortReason) -> Self {
        Apdu::Abort {
            server,
            invoke_id,
            abort_reason,
        }
    }

    /// Segment-ACK PDU
    pub fn segment_ack(
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    ) -> Self {
        Apdu::SegmentAck {
            negative,
            server,
            invoke_id,
            sequence_number,
            window_size,
        }
    }

    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke ID, absent only on unconfirmed requests
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    pub fn is_segmented(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { segmented, .. } | Apdu::ComplexAck { segmented, .. } => {
                *segmented
            }
            _ => false,
        }
    }

    pub fn more_follows(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { more_follows, .. }
            | Apdu::ComplexAck { more_follows, .. } => *more_follows,
            _ => false,
        }
    }

    /// Sequence number of a segment or the acknowledged sequence of a Segment-ACK
    pub fn sequence_number(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                sequence_number, ..
            }
            | Apdu::ComplexAck {
                sequence_number, ..
            } => *sequence_number,
            Apdu::SegmentAck {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }

    /// Proposed window of a segment, or the actual window of a Segment-ACK
    pub fn window_size(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                proposed_window_size,
                ..
            }
            | Apdu::ComplexAck {
                proposed_window_size,
                ..
            } => *proposed_window_size,
            Apdu::SegmentAck { window_size, .. } => Some(*window_size),
            _ => None,
        }
    }

    /// Service choice octet as it appears on the wire
    pub fn service_choice(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { service_choice, .. } => Some(*service_choice as u8),
            Apdu::UnconfirmedRequest { service_choice, .. } => Some(*service_choice as u8),
            Apdu::SimpleAck { service_choice, .. }
            | Apdu::ComplexAck { service_choice, .. }
            | Apdu::Error { service_choice, .. } => Some(*service_choice),
            _ => None,
        }
    }

    pub fn service_data(&self) -> Option<&Bytes> {
        match self {
            Apdu::ConfirmedRequest { service_data, .. }
            | Apdu::UnconfirmedRequest { service_data, .. }
            | Apdu::ComplexAck { service_data, .. } => Some(service_data),
            _ => None,
        }
    }

    /// The "server" flag of Segment-ACK and Abort PDUs
    pub fn is_from_server(&self) -> Option<bool> {
        match self {
            Apdu::SegmentAck { server, .. } | Apdu::Abort { server, .. } => Some(*server),
            _ => None,
        }
    }

    /// Copy of a segment with its segmentation header removed
    ///
    /// The service data is left untouched, so the result is the chunk a
    /// [`SegmentationContext`] appends.
    pub fn without_segmentation(&self) -> Apdu {
        let mut chunk = self.clone();
        match &mut chunk {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                sequence_number,
                proposed_window_size,
                ..
            }
            | Apdu::ComplexAck {
                segmented,
                more_follows,
                sequence_number,
                proposed_window_size,
                ..
            } => {
                *segmented = false;
                *more_follows = false;
                *sequence_number = None;
                *proposed_window_size = None;
            }
            _ => {}
        }
        chunk
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(8 + self.service_data().map_or(0, |d| d.len()));

        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::SEGMENTED, *segmented);
                flags.set(PduFlags::MORE_FOLLOWS, *more_follows);
                flags.set(
                    PduFlags::SEGMENTED_RESPONSE_ACCEPTED,
                    *segmented_response_accepted,
                );
                buffer.push(((ApduType::ConfirmedRequest as u8) << 4) | flags.bits());

                buffer.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                buffer.push(*invoke_id);

                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }

                buffer.push(*service_choice as u8);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice as u8);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut flags = PduFlags::empty();
                flags.set(PduFlags::SEGMENTED, *segmented);
                flags.set(PduFlags::MORE_FOLLOWS, *more_follows);
                buffer.push(((ApduType::ComplexAck as u8) << 4) | flags.bits());

                buffer.push(*invoke_id);

                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }

                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                window_size,
            } => {
                let mut flags = AckFlags::empty();
                flags.set(AckFlags::NEGATIVE, *negative);
                flags.set(AckFlags::SERVER, *server);
                buffer.push(((ApduType::SegmentAck as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                encode_enumerated(&mut buffer, *error_class);
                encode_enumerated(&mut buffer, *error_code);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push((*reject_reason).into());
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let flags = if *server {
                    AckFlags::SERVER
                } else {
                    AckFlags::empty()
                };
                buffer.push(((ApduType::Abort as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push((*abort_reason).into());
            }
        }

        buffer
    }

    /// Decode APDU from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| ApplicationError::InvalidApdu("Empty APDU".to_string()))?;
        let pdu_type = ApduType::try_from(first >> 4)?;

        match pdu_type {
            ApduType::ConfirmedRequest => {
                let flags = PduFlags::from_bits_truncate(first);
                let segmented = flags.contains(PduFlags::SEGMENTED);
                let header_len = if segmented { 6 } else { 4 };
                require_len(data, header_len, "Confirmed request")?;

                let max_segments = MaxSegments::from_bits(data[1] >> 4);
                let max_response_size = MaxApduSize::from_bits(data[1]);
                let invoke_id = data[2];
                let (sequence_number, proposed_window_size) = if segmented {
                    (Some(data[3]), Some(data[4]))
                } else {
                    (None, None)
                };

                let choice = data[header_len - 1];
                let service_choice = ConfirmedServiceChoice::try_from(choice).map_err(|_| {
                    ApplicationError::InvalidApdu(format!(
                        "Unknown confirmed service choice {}",
                        choice
                    ))
                })?;

                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows: flags.contains(PduFlags::MORE_FOLLOWS),
                    segmented_response_accepted: flags
                        .contains(PduFlags::SEGMENTED_RESPONSE_ACCEPTED),
                    max_segments,
                    max_response_size,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice,
                    service_data: Bytes::copy_from_slice(&data[header_len..]),
                })
            }

            ApduType::UnconfirmedRequest => {
                require_len(data, 2, "Unconfirmed request")?;
                let service_choice = UnconfirmedServiceChoice::try_from(data[1]).map_err(|_| {
                    ApplicationError::InvalidApdu(format!(
                        "Unknown unconfirmed service choice {}",
                        data[1]
                    ))
                })?;

                Ok(Apdu::UnconfirmedRequest {
                    service_choice,
                    service_data: Bytes::copy_from_slice(&data[2..]),
                })
            }

            ApduType::SimpleAck => {
                require_len(data, 3, "SimpleAck")?;
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                let flags = PduFlags::from_bits_truncate(first);
                let segmented = flags.contains(PduFlags::SEGMENTED);
                let header_len = if segmented { 5 } else { 3 };
                require_len(data, header_len, "ComplexAck")?;

                let (sequence_number, proposed_window_size) = if segmented {
                    (Some(data[2]), Some(data[3]))
                } else {
                    (None, None)
                };

                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows: flags.contains(PduFlags::MORE_FOLLOWS),
                    invoke_id: data[1],
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[header_len - 1],
                    service_data: Bytes::copy_from_slice(&data[header_len..]),
                })
            }

            ApduType::SegmentAck => {
                require_len(data, 4, "SegmentAck")?;
                let flags = AckFlags::from_bits_truncate(first);

                Ok(Apdu::SegmentAck {
                    negative: flags.contains(AckFlags::NEGATIVE),
                    server: flags.contains(AckFlags::SERVER),
                    invoke_id: data[1],
                    sequence_number: data[2],
                    window_size: data[3],
                })
            }

            ApduType::Error => {
                require_len(data, 3, "Error PDU")?;
                let mut pos = 3;
                let error_class = decode_enumerated(data, &mut pos)?;
                let error_code = decode_enumerated(data, &mut pos)?;

                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    error_class,
                    error_code,
                })
            }

            ApduType::Reject => {
                require_len(data, 3, "Reject PDU")?;
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: RejectReason::from(data[2]),
                })
            }

            ApduType::Abort => {
                require_len(data, 3, "Abort PDU")?;
                Ok(Apdu::Abort {
                    server: AckFlags::from_bits_truncate(first).contains(AckFlags::SERVER),
                    invoke_id: data[1],
                    abort_reason: AbortReason::from(data[2]),
                })
            }
        }
    }
}

fn require_len(data: &[u8], len: usize, what: &str) -> Result<()> {
    if data.len() < len {
        return Err(ApplicationError::InvalidApdu(format!("{} too short", what)));
    }
    Ok(())
}

/// Enumerated application tag (tag number 9) with a one or two octet value
fn encode_enumerated(buffer: &mut Vec<u8>, value: u16) {
    if value <= 0xFF {
        buffer.push(0x91);
        buffer.push(value as u8);
    } else {
        buffer.push(0x92);
        buffer.extend_from_slice(&value.to_be_bytes());
    }
}

fn decode_enumerated(data: &[u8], pos: &mut usize) -> Result<u16> {
    let tag = *data
        .get(*pos)
        .ok_or_else(|| ApplicationError::InvalidApdu("Missing error tag".to_string()))?;
    if tag >> 4 != 9 || tag & 0x08 != 0 {
        return Err(ApplicationError::InvalidApdu(format!(
            "Expected enumerated tag, found 0x{:02X}",
            tag
        )));
    }

    let len = (tag & 0x07) as usize;
    let bytes = data
        .get(*pos + 1..*pos + 1 + len)
        .filter(|b| !b.is_empty() && b.len() <= 2)
        .ok_or_else(|| ApplicationError::InvalidApdu("Bad enumerated length".to_string()))?;
    *pos += 1 + len;

    Ok(bytes.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16))
}

/// An APDU with the addressing and network metadata it travels with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub apdu: Apdu,
    /// Peer the PDU came from, set on PDUs received from the network
    pub source: Option<NetworkAddress>,
    /// Peer the PDU is for, set on PDUs headed to the network
    pub destination: Option<NetworkAddress>,
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl Pdu {
    /// PDU addressed to `destination`
    pub fn to(destination: NetworkAddress, apdu: Apdu) -> Self {
        Self {
            expecting_reply: matches!(apdu, Apdu::ConfirmedRequest { .. }),
            apdu,
            source: None,
            destination: Some(destination),
            priority: 0,
        }
    }

    /// PDU received from `source`
    pub fn from_peer(source: NetworkAddress, apdu: Apdu) -> Self {
        Self {
            expecting_reply: matches!(apdu, Apdu::ConfirmedRequest { .. }),
            apdu,
            source: Some(source),
            destination: None,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority & 0x03;
        self
    }
}

/// Application layer configuration
///
/// Local device defaults every new transaction starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ApplicationConfig {
    /// Maximum APDU length this device accepts
    pub max_apdu_length_accepted: MaxApduSize,
    /// Segmentation support
    pub segmentation_supported: Segmentation,
    /// Maximum segments this device accepts in a segmented response
    pub max_segments_accepted: MaxSegments,
    /// Time to wait for a reply to a confirmed request
    pub apdu_timeout: Duration,
    /// Time to wait for a segment or Segment-ACK
    pub segment_timeout: Duration,
    /// Retransmissions before a client transaction gives up
    pub number_of_apdu_retries: u8,
    /// Window proposed when this device sends or receives segments
    pub proposed_window_size: u8,
    /// Time the local application has to answer a confirmed request
    pub application_timeout: Duration,
    /// Initial device communication control mode
    pub communication_control: EnableDisable,
}

impl ApplicationConfig {
    pub fn with_max_apdu_length_accepted(mut self, size: MaxApduSize) -> Self {
        self.max_apdu_length_accepted = size;
        self
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation_supported = segmentation;
        self
    }

    pub fn with_max_segments_accepted(mut self, max_segments: MaxSegments) -> Self {
        self.max_segments_accepted = max_segments;
        self
    }

    pub fn with_apdu_timeout(mut self, timeout: Duration) -> Self {
        self.apdu_timeout = timeout;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.number_of_apdu_retries = retries;
        self
    }

    /// Window size is clamped to 1..=127
    pub fn with_proposed_window_size(mut self, window: u8) -> Self {
        self.proposed_window_size = window.clamp(1, 127);
        self
    }

    pub fn with_application_timeout(mut self, timeout: Duration) -> Self {
        self.application_timeout = timeout;
        self
    }

    pub fn with_communication_control(mut self, mode: EnableDisable) -> Self {
        self.communication_control = mode;
        self
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            max_apdu_length_accepted: MaxApduSize::Up1024,
            segmentation_supported: Segmentation::NoSegmentation,
            max_segments_accepted: MaxSegments::Two,
            apdu_timeout: Duration::from_millis(3000),
            segment_timeout: Duration::from_millis(1500),
            number_of_apdu_retries: 3,
            proposed_window_size: 2,
            application_timeout: Duration::from_millis(3000),
            communication_control: EnableDisable::Enable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfirmed_request_encode_decode() {
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::WhoIs,
            service_data: Bytes::from_static(&[0x09, 0x7B, 0x19, 0x7B]), // Range 123-123
        };

        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x10, 0x08, 0x09, 0x7B, 0x19, 0x7B]);

        match Apdu::decode(&encoded).unwrap() {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                assert_eq!(service_choice, UnconfirmedServiceChoice::WhoIs);
                assert_eq!(&service_data[..], &[0x09, 0x7B, 0x19, 0x7B]);
            }
            _ => panic!("Expected UnconfirmedRequest"),
        }
    }

    #[test]
    fn test_segmented_confirmed_request_layout() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Four,
            max_response_size: MaxApduSize::Up480,
            invoke_id: 77,
            sequence_number: Some(3),
            proposed_window_size: Some(2),
            service_choice: ConfirmedServiceChoice::WritePropertyMultiple,
            service_data: Bytes::from_static(&[0xAA, 0xBB]),
        };

        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x0E, 0x23, 77, 3, 2, 16, 0xAA, 0xBB]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segmented_complex_ack_layout() {
        let apdu = Apdu::ComplexAck {
            segmented: true,
            more_follows: false,
            invoke_id: 9,
            sequence_number: Some(255),
            proposed_window_size: Some(4),
            service_choice: 14,
            service_data: Bytes::from_static(&[1, 2, 3]),
        };

        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x38, 9, 255, 4, 14, 1, 2, 3]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_segment_ack_and_abort_flags() {
        let ack = Apdu::segment_ack(true, true, 5, 10, 3);
        assert_eq!(ack.encode(), vec![0x43, 5, 10, 3]);
        assert_eq!(ack.is_from_server(), Some(true));

        let abort = Apdu::abort(false, 5, AbortReason::NoResponse);
        assert_eq!(abort.encode(), vec![0x70, 5, 65]);

        match Apdu::decode(&[0x71, 8, 4]).unwrap() {
            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                assert!(server);
                assert_eq!(invoke_id, 8);
                assert_eq!(abort_reason, AbortReason::SegmentationNotSupported);
            }
            _ => panic!("Expected Abort"),
        }
    }

    #[test]
    fn test_error_pdu_uses_enumerated_tags() {
        let apdu = Apdu::Error {
            invoke_id: 1,
            service_choice: 12,
            error_class: 2,   // property
            error_code: 32,   // unknown-property
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x50, 1, 12, 0x91, 2, 0x91, 32]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);

        let proprietary = Apdu::Error {
            invoke_id: 1,
            service_choice: 12,
            error_class: 1,
            error_code: 300,
        };
        assert_eq!(Apdu::decode(&proprietary.encode()).unwrap(), proprietary);

        assert!(Apdu::decode(&[0x50, 1, 12, 0x21, 2]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_headers() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x08, 0x05, 0x01, 0x00]).is_err()); // segmented, no seq/window
        assert!(Apdu::decode(&[0x38, 0x01, 0x00]).is_err());
        assert!(Apdu::decode(&[0x40, 1, 2]).is_err());
        assert_eq!(
            Apdu::decode(&[0x80]),
            Err(ApplicationError::UnsupportedApduType(8))
        );
    }

    #[test]
    fn test_without_segmentation_keeps_payload() {
        let segment = Apdu::ComplexAck {
            segmented: true,
            more_follows: true,
            invoke_id: 3,
            sequence_number: Some(1),
            proposed_window_size: Some(2),
            service_choice: 12,
            service_data: Bytes::from_static(b"chunk"),
        };

        let chunk = segment.without_segmentation();
        assert!(!chunk.is_segmented());
        assert!(!chunk.more_follows());
        assert_eq!(chunk.sequence_number(), None);
        assert_eq!(chunk.service_data().unwrap().as_ref(), b"chunk");
        assert_eq!(chunk.invoke_id(), Some(3));
    }

    #[test]
    fn test_max_apdu_size() {
        assert_eq!(MaxApduSize::Up50.size(), 50);
        assert_eq!(MaxApduSize::Up1476.size(), 1476);
        assert_eq!(MaxApduSize::from_size(1476), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::from_size(1000), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::from_size(10), MaxApduSize::Up50);
    }

    #[test]
    fn test_max_segments() {
        assert_eq!(MaxSegments::Two.count(), Some(2));
        assert_eq!(MaxSegments::Unspecified.count(), None);
        assert_eq!(MaxSegments::GreaterThan64.count(), None);
        assert_eq!(MaxSegments::from_count(10), MaxSegments::Eight);
        assert_eq!(MaxSegments::from_count(100), MaxSegments::GreaterThan64);
    }

    #[test]
    fn test_pdu_builders() {
        let peer = NetworkAddress::local(vec![10, 0, 0, 1, 0xBA, 0xC0]);
        let pdu = Pdu::to(peer.clone(), Apdu::abort(true, 1, AbortReason::Other)).with_priority(7);

        assert_eq!(pdu.destination, Some(peer));
        assert!(pdu.source.is_none());
        assert!(!pdu.expecting_reply);
        assert_eq!(pdu.priority, 3);
    }

    #[test]
    fn test_default_config() {
        let config = ApplicationConfig::default();
        assert_eq!(config.max_apdu_length_accepted.size(), 1024);
        assert_eq!(config.segmentation_supported, Segmentation::NoSegmentation);
        assert_eq!(config.number_of_apdu_retries, 3);
        assert_eq!(config.proposed_window_size, 2);

        let tuned = config.with_proposed_window_size(0).with_retries(1);
        assert_eq!(tuned.proposed_window_size, 1);
        assert_eq!(tuned.number_of_apdu_retries, 1);
    }
}
