//! BACnet/IP Data Link Implementation
//!
//! This module implements the BACnet/IP data link layer as defined in ASHRAE 135 Annex J.
//! BACnet/IP uses UDP as the transport protocol on port 47808 (0xBAC0).
//!
//! # Overview
//!
//! [`BipDataLink`] sends Original-Unicast-NPDU and Original-Broadcast-NPDU messages and
//! accepts those plus Forwarded-NPDU from a BBMD. Broadcast distribution tables and
//! foreign device registration are not handled; other BVLC functions are ignored.
//!
//! The socket is opened through `socket2` so the address can be shared
//! (`SO_REUSEADDR`) and broadcasts are permitted (`SO_BROADCAST`). When no broadcast
//! address is given, it is looked up on the interface that owns the bind address.
//!
//! # BVLC Functions
//!
//! - Original-Unicast-NPDU
//! - Original-Broadcast-NPDU
//! - Forwarded-NPDU

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::datalink::{DataLink, DataLinkError, Result};
use crate::network::NetworkAddress;

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// BVLC type octet for BACnet/IP
pub const BVLC_TYPE_BIP: u8 = 0x81;

/// Largest UDP payload read in one go
const MAX_FRAME_LEN: usize = 1500;

/// BVLC (BACnet Virtual Link Control) message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    /// BVLC-Result
    Result = 0x00,
    /// Write-Broadcast-Distribution-Table
    WriteBroadcastDistributionTable = 0x01,
    /// Read-Broadcast-Distribution-Table
    ReadBroadcastDistributionTable = 0x02,
    /// Read-Broadcast-Distribution-Table-Ack
    ReadBroadcastDistributionTableAck = 0x03,
    /// Forwarded-NPDU
    ForwardedNpdu = 0x04,
    /// Register-Foreign-Device
    RegisterForeignDevice = 0x05,
    /// Read-Foreign-Device-Table
    ReadForeignDeviceTable = 0x06,
    /// Read-Foreign-Device-Table-Ack
    ReadForeignDeviceTableAck = 0x07,
    /// Delete-Foreign-Device-Table-Entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Distribute-Broadcast-To-Network
    DistributeBroadcastToNetwork = 0x09,
    /// Original-Unicast-NPDU
    OriginalUnicastNpdu = 0x0A,
    /// Original-Broadcast-NPDU
    OriginalBroadcastNpdu = 0x0B,
    /// Secure-BVLL
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvlcFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Result),
            0x01 => Ok(Self::WriteBroadcastDistributionTable),
            0x02 => Ok(Self::ReadBroadcastDistributionTable),
            0x03 => Ok(Self::ReadBroadcastDistributionTableAck),
            0x04 => Ok(Self::ForwardedNpdu),
            0x05 => Ok(Self::RegisterForeignDevice),
            0x06 => Ok(Self::ReadForeignDeviceTable),
            0x07 => Ok(Self::ReadForeignDeviceTableAck),
            0x08 => Ok(Self::DeleteForeignDeviceTableEntry),
            0x09 => Ok(Self::DistributeBroadcastToNetwork),
            0x0A => Ok(Self::OriginalUnicastNpdu),
            0x0B => Ok(Self::OriginalBroadcastNpdu),
            0x0C => Ok(Self::SecureBvll),
            _ => Err(DataLinkError::InvalidFrame),
        }
    }
}

/// BVLC header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvlcHeader {
    /// BVLC type (always 0x81 for BACnet/IP)
    pub bvlc_type: u8,
    /// BVLC function
    pub function: BvlcFunction,
    /// Total message length including BVLC header
    pub length: u16,
}

impl BvlcHeader {
    pub const LEN: usize = 4;

    /// Header for a message carrying `payload_len` octets after the header
    pub fn new(function: BvlcFunction, payload_len: usize) -> Result<Self> {
        let length = u16::try_from(Self::LEN + payload_len).map_err(|_| DataLinkError::InvalidFrame)?;
        Ok(Self {
            bvlc_type: BVLC_TYPE_BIP,
            function,
            length,
        })
    }

    /// Encode BVLC header to bytes
    pub fn encode(&self) -> [u8; 4] {
        let [hi, lo] = self.length.to_be_bytes();
        [self.bvlc_type, self.function as u8, hi, lo]
    }

    /// Decode BVLC header from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN || data[0] != BVLC_TYPE_BIP {
            return Err(DataLinkError::InvalidFrame);
        }

        Ok(BvlcHeader {
            bvlc_type: data[0],
            function: BvlcFunction::try_from(data[1])?,
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// Wrap an NPDU in a BVLC message
pub fn encode_bvlc(function: BvlcFunction, npdu: &[u8]) -> Result<Vec<u8>> {
    let header = BvlcHeader::new(function, npdu.len())?;
    let mut frame = Vec::with_capacity(header.length as usize);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(npdu);
    Ok(frame)
}

/// Extract the NPDU and originating station from a received BVLC message
///
/// Returns `Ok(None)` for BVLC functions that carry no NPDU for this station.
pub fn decode_bvlc(data: &[u8], source: SocketAddr) -> Result<Option<(Vec<u8>, SocketAddr)>> {
    let header = BvlcHeader::decode(data)?;
    if data.len() != header.length as usize {
        return Err(DataLinkError::InvalidFrame);
    }

    match header.function {
        BvlcFunction::OriginalUnicastNpdu | BvlcFunction::OriginalBroadcastNpdu => {
            if data.len() == BvlcHeader::LEN {
                return Err(DataLinkError::InvalidFrame);
            }
            Ok(Some((data[BvlcHeader::LEN..].to_vec(), source)))
        }
        BvlcFunction::ForwardedNpdu => {
            // Original source B/IP address follows the header
            match &data[BvlcHeader::LEN..] {
                [a, b, c, d, hi, lo, npdu @ ..] if !npdu.is_empty() => {
                    let origin = SocketAddrV4::new(
                        Ipv4Addr::new(*a, *b, *c, *d),
                        u16::from_be_bytes([*hi, *lo]),
                    );
                    Ok(Some((npdu.to_vec(), SocketAddr::V4(origin))))
                }
                _ => Err(DataLinkError::InvalidFrame),
            }
        }
        other => {
            debug!("ignoring BVLC {:?} from {}", other, source);
            Ok(None)
        }
    }
}

/// Directed broadcast address of the interface that owns `ip`
///
/// An unspecified `ip` picks the first non-loopback IPv4 interface. Falls back to the
/// limited broadcast address when nothing matches.
pub fn discover_broadcast(ip: Ipv4Addr, port: u16) -> SocketAddr {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            debug!("interface lookup failed: {}", err);
            Vec::new()
        }
    };

    let broadcast = interfaces
        .iter()
        .filter(|iface| !iface.is_loopback() || ip.is_loopback())
        .find_map(|iface| match &iface.addr {
            if_addrs::IfAddr::V4(v4) if ip.is_unspecified() || v4.ip == ip => Some(
                v4.broadcast
                    .unwrap_or_else(|| Ipv4Addr::from(u32::from(v4.ip) | !u32::from(v4.netmask))),
            ),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::BROADCAST);

    SocketAddr::V4(SocketAddrV4::new(broadcast, port))
}

/// BACnet/IP data link implementation
#[derive(Debug)]
pub struct BipDataLink {
    socket: UdpSocket,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
}

impl BipDataLink {
    /// Bind to `bind_addr` and broadcast to `broadcast_addr`
    pub async fn new(bind_addr: SocketAddr, broadcast_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::from_std(open_socket(bind_addr)?)?;
        let local_addr = socket.local_addr()?;
        debug!("B/IP bound to {}, broadcast {}", local_addr, broadcast_addr);

        Ok(Self {
            socket,
            local_addr,
            broadcast_addr,
        })
    }

    /// Bind to `bind_addr`, broadcasting on the owning interface's directed broadcast address
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let ip = match bind_addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => {
                return Err(DataLinkError::AddressError(
                    "BACnet/IP needs an IPv4 address".to_string(),
                ))
            }
        };
        Self::new(bind_addr, discover_broadcast(ip, bind_addr.port())).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast_addr
    }

    /// Send a unicast NPDU
    pub async fn send_unicast_npdu(&self, npdu: &[u8], dest: SocketAddr) -> Result<()> {
        let frame = encode_bvlc(BvlcFunction::OriginalUnicastNpdu, npdu)?;
        self.socket.send_to(&frame, dest).await?;
        Ok(())
    }

    /// Send a broadcast NPDU
    pub async fn send_broadcast_npdu(&self, npdu: &[u8]) -> Result<()> {
        let frame = encode_bvlc(BvlcFunction::OriginalBroadcastNpdu, npdu)?;
        self.socket.send_to(&frame, self.broadcast_addr).await?;
        Ok(())
    }
}

fn open_socket(bind_addr: SocketAddr) -> Result<std::net::UdpSocket> {
    if !bind_addr.is_ipv4() {
        return Err(DataLinkError::AddressError(
            "BACnet/IP needs an IPv4 address".to_string(),
        ));
    }

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

#[async_trait]
impl DataLink for BipDataLink {
    async fn send_frame(&self, npdu: &[u8], destination: &NetworkAddress) -> Result<()> {
        if destination.is_broadcast() {
            return self.send_broadcast_npdu(npdu).await;
        }

        let dest = destination
            .to_socket_addr()
            .map_err(|err| DataLinkError::AddressError(err.to_string()))?;
        self.send_unicast_npdu(npdu, dest).await
    }

    async fn receive_frame(&self) -> Result<(Vec<u8>, NetworkAddress)> {
        let mut buffer = [0u8; MAX_FRAME_LEN];
        loop {
            let (len, source) = self.socket.recv_from(&mut buffer).await?;
            if source == self.local_addr {
                trace!("skipping own broadcast");
                continue;
            }

            match decode_bvlc(&buffer[..len], source) {
                Ok(Some((npdu, origin))) => {
                    return Ok((npdu, NetworkAddress::from_socket_addr(origin)))
                }
                Ok(None) => {}
                Err(err) => debug!("dropping datagram from {}: {}", source, err),
            }
        }
    }

    fn local_address(&self) -> NetworkAddress {
        NetworkAddress::from_socket_addr(self.local_addr)
    }
}
