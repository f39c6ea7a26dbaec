//! State machine access point.
//!
//! The [`StateMachineAccessPoint`] owns every live transaction of a device. It hands out
//! invoke IDs, routes each PDU to the client or server transaction it belongs to, applies
//! device communication control, and turns transaction actions into [`SapAction`]s keyed
//! by [`TransactionKey`] so a runtime knows which timer to arm or cancel.
//!
//! Terminal transactions are removed as soon as the event that finished them returns.
//!
//! # Example
//!
//! ```
//! use bacnet_appservice::app::*;
//! use bacnet_appservice::network::NetworkAddress;
//! use bacnet_appservice::service::ConfirmedServiceChoice;
//! use bytes::Bytes;
//!
//! let mut sap = StateMachineAccessPoint::new(ApplicationConfig::default());
//! let peer = NetworkAddress::from_socket_addr("10.0.0.5:47808".parse().unwrap());
//! let invoke_id = sap.next_invoke_id(&peer).unwrap();
//!
//! let request = Apdu::ConfirmedRequest {
//!     segmented: false,
//!     more_follows: false,
//!     segmented_response_accepted: false,
//!     max_segments: MaxSegments::Unspecified,
//!     max_response_size: MaxApduSize::Up1476,
//!     invoke_id,
//!     sequence_number: None,
//!     proposed_window_size: None,
//!     service_choice: ConfirmedServiceChoice::ReadProperty,
//!     service_data: Bytes::from_static(&[0x0C, 0x02, 0x00, 0x00, 0x08, 0x19, 0x4D]),
//! };
//! let actions = sap.sap_indication(Pdu::to(peer.clone(), request)).unwrap();
//!
//! assert!(matches!(actions[0], SapAction::ArmTimer { .. }));
//! assert!(matches!(actions[1], SapAction::ToNetwork(_)));
//! assert_eq!(sap.client_count(), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::app::client::ClientSsm;
use crate::app::server::ServerSsm;
use crate::app::ssm::SsmAction;
use crate::app::{Apdu, ApplicationConfig, ApplicationError, DeviceInfoCache, Pdu, Result, SsmState};
use crate::network::NetworkAddress;
use crate::service::{EnableDisable, UnconfirmedServiceChoice};

/// Which side of a transaction this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Client,
    Server,
}

/// Identity of one transaction within an access point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionKey {
    pub role: Role,
    pub peer: NetworkAddress,
    pub invoke_id: u8,
}

impl TransactionKey {
    pub fn client(peer: NetworkAddress, invoke_id: u8) -> Self {
        Self {
            role: Role::Client,
            peer,
            invoke_id,
        }
    }

    pub fn server(peer: NetworkAddress, invoke_id: u8) -> Self {
        Self {
            role: Role::Server,
            peer,
            invoke_id,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Client => "client",
            Role::Server => "server",
        };
        write!(f, "{} {}#{}", role, self.peer, self.invoke_id)
    }
}

/// Work the access point asks its runtime to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SapAction {
    /// Encode and transmit to `pdu.destination`
    ToNetwork(Pdu),
    /// Hand to the local application
    ToApplication(Pdu),
    /// (Re)arm the timer of a transaction
    ArmTimer { key: TransactionKey, after: Duration },
    /// Cancel the timer of a transaction
    CancelTimer { key: TransactionKey },
}

/// Transaction table and dispatcher of one BACnet device
#[derive(Debug)]
pub struct StateMachineAccessPoint {
    config: ApplicationConfig,
    device_cache: DeviceInfoCache,
    client_transactions: HashMap<(NetworkAddress, u8), ClientSsm>,
    server_transactions: HashMap<(NetworkAddress, u8), ServerSsm>,
    next_invoke_id: u8,
    communication_control: EnableDisable,
}

impl StateMachineAccessPoint {
    pub fn new(config: ApplicationConfig) -> Self {
        Self::with_device_cache(config, DeviceInfoCache::new())
    }

    /// Access point sharing an existing peer capability cache
    pub fn with_device_cache(config: ApplicationConfig, device_cache: DeviceInfoCache) -> Self {
        Self {
            communication_control: config.communication_control,
            config,
            device_cache,
            client_transactions: HashMap::new(),
            server_transactions: HashMap::new(),
            next_invoke_id: 1,
        }
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn device_cache(&self) -> &DeviceInfoCache {
        &self.device_cache
    }

    pub fn communication_control(&self) -> EnableDisable {
        self.communication_control
    }

    pub fn set_communication_control(&mut self, mode: EnableDisable) {
        if mode != self.communication_control {
            debug!(
                "communication control {:?} -> {:?}",
                self.communication_control, mode
            );
        }
        self.communication_control = mode;
    }

    pub fn client_count(&self) -> usize {
        self.client_transactions.len()
    }

    pub fn server_count(&self) -> usize {
        self.server_transactions.len()
    }

    pub fn client_transaction(&self, peer: &NetworkAddress, invoke_id: u8) -> Option<&ClientSsm> {
        self.client_transactions.get(&(peer.clone(), invoke_id))
    }

    pub fn server_transaction(&self, peer: &NetworkAddress, invoke_id: u8) -> Option<&ServerSsm> {
        self.server_transactions.get(&(peer.clone(), invoke_id))
    }

    /// Next invoke ID not held by a client transaction to `peer`
    ///
    /// IDs run 1..=255 and wrap; 0 is never handed out.
    pub fn next_invoke_id(&mut self, peer: &NetworkAddress) -> Result<u8> {
        let initial = self.next_invoke_id;
        loop {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = if candidate == u8::MAX { 1 } else { candidate + 1 };

            if !self
                .client_transactions
                .contains_key(&(peer.clone(), candidate))
            {
                return Ok(candidate);
            }
            if self.next_invoke_id == initial {
                return Err(ApplicationError::NoAvailableInvokeId(peer.clone()));
            }
        }
    }

    /// New outbound work from the application
    pub fn sap_indication(&mut self, pdu: Pdu) -> Result<Vec<SapAction>> {
        match self.communication_control {
            EnableDisable::Enable => {}
            EnableDisable::Disable => {
                debug!("communication disabled, dropping {:?}", pdu.apdu.apdu_type());
                return Ok(Vec::new());
            }
            EnableDisable::DisableInitiation => {
                if !matches!(
                    pdu.apdu,
                    Apdu::UnconfirmedRequest {
                        service_choice: UnconfirmedServiceChoice::IAm,
                        ..
                    }
                ) {
                    debug!("initiation disabled, dropping {:?}", pdu.apdu.apdu_type());
                    return Ok(Vec::new());
                }
            }
        }

        let destination = pdu
            .destination
            .clone()
            .ok_or(ApplicationError::MissingAddress("destination"))?;

        match &pdu.apdu {
            Apdu::UnconfirmedRequest { .. } => Ok(vec![SapAction::ToNetwork(pdu)]),
            Apdu::ConfirmedRequest { invoke_id, .. } => {
                let invoke_id = *invoke_id;
                let table_key = (destination.clone(), invoke_id);
                if self.client_transactions.contains_key(&table_key) {
                    return Err(ApplicationError::InvokeIdInUse {
                        invoke_id,
                        peer: destination,
                    });
                }

                let device_info = self.device_cache.get(&destination);
                let mut transaction = ClientSsm::new(destination.clone(), &self.config, device_info);
                let result = transaction.indication(pdu.apdu);
                let key = TransactionKey::client(destination, invoke_id);
                let actions = route(&key, transaction.take_actions());
                result?;

                if transaction.is_terminal() {
                    debug!("{} finished on creation", key);
                } else {
                    self.client_transactions.insert(table_key, transaction);
                }
                Ok(actions)
            }
            other => Err(ApplicationError::InvalidApdu(format!(
                "{:?} cannot start a transaction",
                other.apdu_type()
            ))),
        }
    }

    /// The application's answer to a request it received
    pub fn sap_confirmation(&mut self, pdu: Pdu) -> Result<Vec<SapAction>> {
        let destination = pdu
            .destination
            .clone()
            .ok_or(ApplicationError::MissingAddress("destination"))?;

        match &pdu.apdu {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => {
                let key = TransactionKey::server(destination, *invoke_id);
                self.with_server(key, |transaction| transaction.confirmation(pdu.apdu))
            }
            other => Err(ApplicationError::InvalidApdu(format!(
                "{:?} is not a response",
                other.apdu_type()
            ))),
        }
    }

    /// A PDU received from the network
    pub fn confirmation(&mut self, pdu: Pdu) -> Result<Vec<SapAction>> {
        let source = pdu
            .source
            .clone()
            .ok_or(ApplicationError::MissingAddress("source"))?;

        if self.communication_control == EnableDisable::Disable && !passes_when_disabled(&pdu.apdu) {
            debug!(
                "communication disabled, ignoring {:?} from {}",
                pdu.apdu.apdu_type(),
                source
            );
            return Ok(Vec::new());
        }

        match &pdu.apdu {
            Apdu::ConfirmedRequest { invoke_id, .. } => {
                let table_key = (source.clone(), *invoke_id);
                if !self.server_transactions.contains_key(&table_key) {
                    trace!("new server transaction {}#{}", source, invoke_id);
                    let transaction =
                        ServerSsm::new(source.clone(), &self.config, self.device_cache.clone());
                    self.server_transactions.insert(table_key, transaction);
                }
                let key = TransactionKey::server(source, *invoke_id);
                self.with_server(key, |transaction| transaction.indication(pdu.apdu))
            }
            Apdu::UnconfirmedRequest { .. } => Ok(vec![SapAction::ToApplication(pdu)]),
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. } => {
                let key = TransactionKey::client(source, *invoke_id);
                self.with_client(key, |transaction| transaction.confirmation(pdu.apdu))
            }
            Apdu::SegmentAck {
                server, invoke_id, ..
            }
            | Apdu::Abort {
                server, invoke_id, ..
            } => {
                if *server {
                    let key = TransactionKey::client(source, *invoke_id);
                    self.with_client(key, |transaction| transaction.confirmation(pdu.apdu))
                } else {
                    let key = TransactionKey::server(source, *invoke_id);
                    self.with_server(key, |transaction| transaction.indication(pdu.apdu))
                }
            }
        }
    }

    /// The timer of the transaction `key` fired
    pub fn timer_expired(&mut self, key: &TransactionKey) -> Result<Vec<SapAction>> {
        match key.role {
            Role::Client => self.with_client(key.clone(), ClientSsm::timer_expired),
            Role::Server => self.with_server(key.clone(), ServerSsm::timer_expired),
        }
    }

    fn with_client<F>(&mut self, key: TransactionKey, event: F) -> Result<Vec<SapAction>>
    where
        F: FnOnce(&mut ClientSsm) -> Result<()>,
    {
        let table_key = (key.peer.clone(), key.invoke_id);
        let Some(transaction) = self.client_transactions.get_mut(&table_key) else {
            debug!("no transaction for {}, dropping", key);
            return Ok(Vec::new());
        };
        if transaction.is_terminal() {
            debug!("{} already finished, dropping", key);
            return Ok(Vec::new());
        }

        let result = event(transaction);
        let actions = route(&key, transaction.take_actions());
        if transaction.is_terminal() {
            debug!("{} finished in {}", key, transaction.state());
            self.client_transactions.remove(&table_key);
        }

        if let Err(err) = result {
            warn!("{}: {}", key, err);
            return Err(err);
        }
        Ok(actions)
    }

    fn with_server<F>(&mut self, key: TransactionKey, event: F) -> Result<Vec<SapAction>>
    where
        F: FnOnce(&mut ServerSsm) -> Result<()>,
    {
        let table_key = (key.peer.clone(), key.invoke_id);
        let Some(transaction) = self.server_transactions.get_mut(&table_key) else {
            debug!("no transaction for {}, dropping", key);
            return Ok(Vec::new());
        };
        if transaction.is_terminal() {
            debug!("{} already finished, dropping", key);
            return Ok(Vec::new());
        }

        let result = event(transaction);
        let actions = route(&key, transaction.take_actions());
        // A request that never got past IDLE leaves nothing worth keeping
        if transaction.is_terminal() || transaction.state() == SsmState::Idle {
            debug!("{} finished in {}", key, transaction.state());
            self.server_transactions.remove(&table_key);
        }

        if let Err(err) = result {
            warn!("{}: {}", key, err);
            return Err(err);
        }
        Ok(actions)
    }
}

/// Inbound traffic still processed while communication is disabled
fn passes_when_disabled(apdu: &Apdu) -> bool {
    match apdu {
        Apdu::ConfirmedRequest { service_choice, .. } => service_choice.allowed_when_disabled(),
        Apdu::UnconfirmedRequest { service_choice, .. } => {
            *service_choice == UnconfirmedServiceChoice::WhoIs
        }
        _ => false,
    }
}

fn route(key: &TransactionKey, actions: Vec<SsmAction>) -> Vec<SapAction> {
    actions
        .into_iter()
        .map(|action| match action {
            SsmAction::Send(pdu) => SapAction::ToNetwork(pdu),
            SsmAction::Deliver(pdu) => SapAction::ToApplication(pdu),
            SsmAction::StartTimer(after) => SapAction::ArmTimer {
                key: key.clone(),
                after,
            },
            SsmAction::StopTimer => SapAction::CancelTimer { key: key.clone() },
        })
        .collect()
}
