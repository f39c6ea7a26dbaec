//! BACnet Network Layer Module
//!
//! The application layer never routes, but it needs two things from the network layer:
//! a peer address that identifies the remote end of a transaction, and the NPDU header
//! that wraps every APDU on the wire.
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU contains:
//! - Protocol version
//! - Control information (priority, data expecting reply, etc.)
//! - Destination network address (DNET, DADR) and hop count
//! - Source network address (SNET, SADR)
//!
//! Network layer messages (router discovery and the like) are recognised and skipped;
//! routing tables are outside the scope of this crate.
//!
//! # Example
//!
//! ```
//! use bacnet_appservice::network::{NetworkAddress, Npdu};
//!
//! let peer = NetworkAddress::from_socket_addr("192.168.1.10:47808".parse().unwrap());
//! let npdu = Npdu::for_apdu(&peer, true, 0);
//! let encoded = npdu.encode();
//! assert_eq!(encoded, vec![0x01, 0x04]);
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in network operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid NPDU format
    #[error("Invalid NPDU: {0}")]
    InvalidNpdu(String),
    /// Address cannot be mapped onto the data link
    #[error("Invalid network address: {0}")]
    InvalidAddress(String),
}

/// Network number meaning "every network"
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl NpduControl {
    /// Create control byte from flags
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte |= self.priority & 0x03;
        byte
    }

    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// Network address (network number + MAC address)
///
/// Network 0 is the directly connected network. On BACnet/IP the MAC is six octets:
/// the IPv4 address followed by the UDP port, both big-endian.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddress {
    /// Network number (0 = local network, 65535 = broadcast)
    pub network: u16,
    /// MAC address on that network
    pub address: Vec<u8>,
}

impl NetworkAddress {
    /// Create a new network address
    pub fn new(network: u16, address: Vec<u8>) -> Self {
        Self { network, address }
    }

    /// Station on the directly connected network
    pub fn local(address: Vec<u8>) -> Self {
        Self::new(0, address)
    }

    /// BACnet/IP station on the local network
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let mut mac = ip.octets().to_vec();
        mac.extend_from_slice(&addr.port().to_be_bytes());
        Self::local(mac)
    }

    /// Interpret the MAC as a BACnet/IP address
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self.address.as_slice() {
            [a, b, c, d, hi, lo] => Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(*a, *b, *c, *d),
                u16::from_be_bytes([*hi, *lo]),
            ))),
            other => Err(NetworkError::InvalidAddress(format!(
                "{}-octet MAC is not a BACnet/IP address",
                other.len()
            ))),
        }
    }

    /// Check if this is a broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK || self.address.is_empty()
    }

    /// Check if this is a local network address
    pub fn is_local(&self) -> bool {
        self.network == 0
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            if let Ok(addr) = self.to_socket_addr() {
                return write!(f, "{}", addr);
            }
        }
        if self.address.is_empty() {
            write!(f, "{}:*", self.network)
        } else {
            write!(f, "{}:{}", self.network, hex::encode(&self.address))
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// Network Protocol Data Unit (NPDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    /// Control information
    pub control: NpduControl,
    /// Destination network address
    pub destination: Option<NetworkAddress>,
    /// Source network address
    pub source: Option<NetworkAddress>,
    /// Hop count (only present if destination is present)
    pub hop_count: Option<u8>,
}

impl Npdu {
    /// Create a new NPDU with default values
    pub fn new() -> Self {
        Self {
            version: 1,
            control: NpduControl::default(),
            destination: None,
            source: None,
            hop_count: None,
        }
    }

    /// NPDU header for an APDU sent to `destination`
    ///
    /// Local stations are reached by MAC alone, so DNET/DADR is only written for
    /// remote networks and global broadcasts.
    pub fn for_apdu(destination: &NetworkAddress, expecting_reply: bool, priority: u8) -> Self {
        let remote = (!destination.is_local()).then(|| destination.clone());
        Self {
            version: 1,
            control: NpduControl {
                network_message: false,
                destination_present: remote.is_some(),
                source_present: false,
                expecting_reply,
                priority: priority & 0x03,
            },
            hop_count: remote.as_ref().map(|_| 255),
            destination: remote,
            source: None,
        }
    }

    /// Check if this is a network layer message
    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Encode NPDU to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(2 + 9 + 9 + 1);
        buffer.push(self.version);

        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();
        buffer.push(control.to_byte());

        if let Some(ref dest) = self.destination {
            buffer.extend_from_slice(&dest.network.to_be_bytes());
            buffer.push(dest.address.len() as u8);
            buffer.extend_from_slice(&dest.address);
        }

        if let Some(ref src) = self.source {
            buffer.extend_from_slice(&src.network.to_be_bytes());
            buffer.push(src.address.len() as u8);
            buffer.extend_from_slice(&src.address);
        }

        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(255));
        }

        buffer
    }

    /// Decode NPDU from bytes, returning the header and its length
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".to_string()));
        }

        let version = data[0];
        if version != 1 {
            return Err(NetworkError::InvalidNpdu(format!(
                "Invalid NPDU version: {}",
                version
            )));
        }

        let control = NpduControl::from_byte(data[1]);
        let mut pos = 2;

        let destination = if control.destination_present {
            Some(decode_address(data, &mut pos, "destination")?)
        } else {
            None
        };

        let source = if control.source_present {
            Some(decode_address(data, &mut pos, "source")?)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            let hc = *data
                .get(pos)
                .ok_or_else(|| NetworkError::InvalidNpdu("Missing hop count".to_string()))?;
            pos += 1;
            Some(hc)
        } else {
            None
        };

        let npdu = Npdu {
            version,
            control,
            destination,
            source,
            hop_count,
        };

        Ok((npdu, pos))
    }
}

fn decode_address(data: &[u8], pos: &mut usize, which: &str) -> Result<NetworkAddress> {
    if *pos + 3 > data.len() {
        return Err(NetworkError::InvalidNpdu(format!("Invalid {} address", which)));
    }

    let network = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    let addr_len = data[*pos + 2] as usize;
    *pos += 3;

    if *pos + addr_len > data.len() {
        return Err(NetworkError::InvalidNpdu(format!(
            "Invalid {} address length",
            which
        )));
    }

    let address = data[*pos..*pos + addr_len].to_vec();
    *pos += addr_len;

    Ok(NetworkAddress::new(network, address))
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}
