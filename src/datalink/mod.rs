//! BACnet Data Link Layer Module
//!
//! The data link carries encoded NPDUs between devices. The application service only
//! needs two things from it: send an NPDU to a station (or broadcast it), and wait for the
//! next NPDU together with the station that sent it.
//!
//! # Overview
//!
//! - [`DataLink`]: async trait every binding implements
//! - [`encode_frame`] / [`decode_frame`]: NPDU + APDU framing between a [`Pdu`] and the
//!   octets a data link carries
//! - [`bip`]: BACnet/IP (Annex J) over UDP
//!
//! # Addressing
//!
//! Stations are named with [`NetworkAddress`]. A data link only ever sees local
//! addresses; a station on a remote network is reached with a local broadcast that a
//! router picks up, the NPDU header carrying the real destination.
//!
//! # Example
//!
//! ```
//! use bacnet_appservice::app::{Apdu, Pdu};
//! use bacnet_appservice::datalink::{decode_frame, encode_frame};
//! use bacnet_appservice::network::NetworkAddress;
//! use bacnet_appservice::service::UnconfirmedServiceChoice;
//! use bytes::Bytes;
//!
//! let peer = NetworkAddress::from_socket_addr("10.0.0.9:47808".parse().unwrap());
//! let who_is = Apdu::UnconfirmedRequest {
//!     service_choice: UnconfirmedServiceChoice::WhoIs,
//!     service_data: Bytes::new(),
//! };
//! let (frame, link_destination) = encode_frame(&Pdu::to(peer.clone(), who_is.clone()));
//! assert_eq!(frame, vec![0x01, 0x00, 0x10, 0x08]);
//! assert_eq!(link_destination, peer);
//!
//! let received = decode_frame(&frame, peer.clone()).unwrap().unwrap();
//! assert_eq!(received.apdu, who_is);
//! assert_eq!(received.source, Some(peer));
//! ```

use async_trait::async_trait;
use log::trace;
use thiserror::Error;

use crate::app::{Apdu, ApplicationError, Pdu};
use crate::network::{NetworkAddress, NetworkError, Npdu};
use crate::util::frame_hex;

pub mod bip;

pub use bip::BipDataLink;

/// Result type for data link operations
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur during data link layer operations
#[derive(Debug, Error)]
pub enum DataLinkError {
    /// Socket error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// Frame does not follow the data link's framing rules
    #[error("Invalid frame format")]
    InvalidFrame,
    /// Address cannot be used on this data link
    #[error("Address error: {0}")]
    AddressError(String),
    /// NPDU header could not be decoded
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// APDU could not be decoded
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

/// Common trait for all data link layer implementations
///
/// Methods take `&self` so one task can wait in [`DataLink::receive_frame`] while another
/// sends.
#[async_trait]
pub trait DataLink: Send + Sync {
    /// Send an NPDU to a local station, or broadcast it when `destination` is a broadcast
    /// address
    async fn send_frame(&self, npdu: &[u8], destination: &NetworkAddress) -> Result<()>;

    /// Wait for the next NPDU and the station it came from
    async fn receive_frame(&self) -> Result<(Vec<u8>, NetworkAddress)>;

    /// This station's own address on the link
    fn local_address(&self) -> NetworkAddress;
}

/// Frame a PDU headed for the network
///
/// Returns the NPDU octets and the data link address to send them to.
pub fn encode_frame(pdu: &Pdu) -> (Vec<u8>, NetworkAddress) {
    let destination = pdu
        .destination
        .clone()
        .unwrap_or_else(|| NetworkAddress::local(Vec::new()));

    let npdu = Npdu::for_apdu(&destination, pdu.expecting_reply, pdu.priority);
    let mut frame = npdu.encode();
    frame.extend_from_slice(&pdu.apdu.encode());

    let link_destination = if destination.is_local() {
        destination
    } else {
        NetworkAddress::local(Vec::new())
    };
    trace!("frame -> {}: {}", link_destination, frame_hex(&frame, 32));
    (frame, link_destination)
}

/// Decode an NPDU received from `link_source`
///
/// Network layer messages yield `Ok(None)`. A routed NPDU reports its originating station
/// as the source.
pub fn decode_frame(frame: &[u8], link_source: NetworkAddress) -> Result<Option<Pdu>> {
    trace!("frame <- {}: {}", link_source, frame_hex(frame, 32));
    let (npdu, header_len) = Npdu::decode(frame)?;
    if npdu.is_network_message() {
        return Ok(None);
    }

    let apdu = Apdu::decode(&frame[header_len..])?;
    Ok(Some(Pdu {
        apdu,
        source: Some(npdu.source.unwrap_or(link_source)),
        destination: None,
        expecting_reply: npdu.control.expecting_reply,
        priority: npdu.control.priority,
    }))
}
