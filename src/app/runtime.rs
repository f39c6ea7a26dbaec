//! Async application service.
//!
//! [`ApplicationService::spawn`] moves a [`StateMachineAccessPoint`] into a tokio task that
//! owns it along with every transaction timer. The rest of the program talks to that task
//! through a cloneable [`ServiceHandle`] and reads its output from two channels: PDUs for
//! the network and PDUs for the local application.
//!
//! All transaction state lives in the one task, so events for a transaction are handled
//! strictly in order and never concurrently. [`bind_datalink`] connects the service to a
//! [`DataLink`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bacnet_appservice::app::runtime::{bind_datalink, ApplicationService};
//! use bacnet_appservice::app::{ApplicationConfig, StateMachineAccessPoint};
//! use bacnet_appservice::datalink::BipDataLink;
//! use bacnet_appservice::network::NetworkAddress;
//! use bacnet_appservice::service::ConfirmedServiceChoice;
//! use bytes::Bytes;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let datalink = Arc::new(BipDataLink::bind("0.0.0.0:47808".parse()?).await?);
//! let sap = StateMachineAccessPoint::new(ApplicationConfig::default());
//! let ApplicationService {
//!     handle,
//!     to_network,
//!     mut to_application,
//!     ..
//! } = ApplicationService::spawn(sap);
//! bind_datalink(datalink, handle.clone(), to_network);
//!
//! let peer = NetworkAddress::from_socket_addr("192.168.1.20:47808".parse()?);
//! handle
//!     .confirmed_request(
//!         peer,
//!         ConfirmedServiceChoice::ReadProperty,
//!         Bytes::from_static(&[0x0C, 0x02, 0x00, 0x00, 0x08, 0x19, 0x4D]),
//!     )
//!     .await?;
//!
//! while let Some(pdu) = to_application.recv().await {
//!     println!("{:?}", pdu.apdu);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::app::timer::TransactionTimers;
use crate::app::{
    Apdu, ApplicationError, Pdu, Result, SapAction, StateMachineAccessPoint,
};
use crate::datalink::{decode_frame, encode_frame, DataLink, DataLinkError};
use crate::network::NetworkAddress;
use crate::service::{ConfirmedServiceChoice, EnableDisable};

/// Depth of the command queue in front of the service task
pub const COMMAND_QUEUE_DEPTH: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum Command {
    Request { pdu: Pdu, reply: Reply<()> },
    Respond { pdu: Pdu, reply: Reply<()> },
    Deliver(Pdu),
    NextInvokeId { peer: NetworkAddress, reply: Reply<u8> },
    ConfirmedRequest {
        peer: NetworkAddress,
        service_choice: ConfirmedServiceChoice,
        service_data: Bytes,
        reply: Reply<u8>,
    },
    SetCommunicationControl { mode: EnableDisable, reply: Reply<()> },
    Shutdown,
}

/// Cloneable sender side of a running [`ApplicationService`]
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<Command>,
}

impl ServiceHandle {
    /// Start a transaction, or send an unconfirmed request
    pub async fn request(&self, pdu: Pdu) -> Result<()> {
        self.call(|reply| Command::Request { pdu, reply }).await
    }

    /// Answer a confirmed request the application received
    pub async fn respond(&self, pdu: Pdu) -> Result<()> {
        self.call(|reply| Command::Respond { pdu, reply }).await
    }

    /// Hand over a PDU received from the network
    ///
    /// Errors from the access point are logged by the service, not returned.
    pub async fn deliver(&self, pdu: Pdu) -> Result<()> {
        self.commands
            .send(Command::Deliver(pdu))
            .await
            .map_err(|_| ApplicationError::ServiceUnavailable)
    }

    pub async fn next_invoke_id(&self, peer: NetworkAddress) -> Result<u8> {
        self.call(|reply| Command::NextInvokeId { peer, reply }).await
    }

    /// Build and start a confirmed request from the local device's configuration
    ///
    /// Returns the invoke ID the request went out with. While communication control is
    /// `Disable` or `DisableInitiation` the request is dropped: an invoke ID is still
    /// returned, but nothing is sent and no confirmation will reach the application.
    pub async fn confirmed_request(
        &self,
        peer: NetworkAddress,
        service_choice: ConfirmedServiceChoice,
        service_data: Bytes,
    ) -> Result<u8> {
        self.call(|reply| Command::ConfirmedRequest {
            peer,
            service_choice,
            service_data,
            reply,
        })
        .await
    }

    pub async fn set_communication_control(&self, mode: EnableDisable) -> Result<()> {
        self.call(|reply| Command::SetCommunicationControl { mode, reply })
            .await
    }

    /// Stop the service task; pending transactions are dropped
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| ApplicationError::ServiceUnavailable)
    }

    async fn call<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ApplicationError::ServiceUnavailable)?;
        response
            .await
            .map_err(|_| ApplicationError::ServiceUnavailable)?
    }
}

/// A running access point and its output channels
#[derive(Debug)]
pub struct ApplicationService {
    pub handle: ServiceHandle,
    /// PDUs to encode and transmit
    pub to_network: mpsc::UnboundedReceiver<Pdu>,
    /// PDUs for the local application: requests to serve, confirmations, aborts
    pub to_application: mpsc::UnboundedReceiver<Pdu>,
    pub task: JoinHandle<()>,
}

impl ApplicationService {
    /// Move `sap` into a new task on the current tokio runtime
    pub fn spawn(sap: StateMachineAccessPoint) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (network_tx, to_network) = mpsc::unbounded_channel();
        let (application_tx, to_application) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            sap,
            timers: TransactionTimers::new(),
            to_network: network_tx,
            to_application: application_tx,
        };
        let task = tokio::spawn(dispatcher.run(command_rx));

        Self {
            handle: ServiceHandle { commands },
            to_network,
            to_application,
            task,
        }
    }
}

struct Dispatcher {
    sap: StateMachineAccessPoint,
    timers: TransactionTimers,
    to_network: mpsc::UnboundedSender<Pdu>,
    to_application: mpsc::UnboundedSender<Pdu>,
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("application service started");
        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if !self.handle(command) {
                        break;
                    }
                }
                Some(key) = self.timers.next() => {
                    trace!("timer fired for {}", key);
                    let result = self.sap.timer_expired(&key);
                    if let Err(err) = self.settle(result) {
                        debug!("timeout for {} failed: {}", key, err);
                    }
                }
                else => break,
            }
        }
        debug!(
            "application service stopped with {} client and {} server transactions",
            self.sap.client_count(),
            self.sap.server_count()
        );
    }

    /// Returns false once the service should stop
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Request { pdu, reply } => {
                let result = self.sap.sap_indication(pdu);
                let _ = reply.send(self.settle(result));
            }
            Command::Respond { pdu, reply } => {
                let result = self.sap.sap_confirmation(pdu);
                let _ = reply.send(self.settle(result));
            }
            Command::Deliver(pdu) => {
                let result = self.sap.confirmation(pdu);
                if let Err(err) = self.settle(result) {
                    debug!("inbound PDU rejected: {}", err);
                }
            }
            Command::NextInvokeId { peer, reply } => {
                let _ = reply.send(self.sap.next_invoke_id(&peer));
            }
            Command::ConfirmedRequest {
                peer,
                service_choice,
                service_data,
                reply,
            } => {
                let _ = reply.send(self.confirmed_request(peer, service_choice, service_data));
            }
            Command::SetCommunicationControl { mode, reply } => {
                self.sap.set_communication_control(mode);
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn confirmed_request(
        &mut self,
        peer: NetworkAddress,
        service_choice: ConfirmedServiceChoice,
        service_data: Bytes,
    ) -> Result<u8> {
        let invoke_id = self.sap.next_invoke_id(&peer)?;
        let config = self.sap.config();
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: config.segmentation_supported.can_receive(),
            max_segments: config.max_segments_accepted,
            max_response_size: config.max_apdu_length_accepted,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data,
        };

        let result = self.sap.sap_indication(Pdu::to(peer, apdu));
        self.settle(result)?;
        Ok(invoke_id)
    }

    fn settle(&mut self, result: Result<Vec<SapAction>>) -> Result<()> {
        let actions = result?;
        self.apply(actions);
        Ok(())
    }

    fn apply(&mut self, actions: Vec<SapAction>) {
        for action in actions {
            match action {
                SapAction::ToNetwork(pdu) => {
                    if self.to_network.send(pdu).is_err() {
                        warn!("network channel closed, PDU dropped");
                    }
                }
                SapAction::ToApplication(pdu) => {
                    if self.to_application.send(pdu).is_err() {
                        warn!("application channel closed, PDU dropped");
                    }
                }
                SapAction::ArmTimer { key, after } => self.timers.arm(key, after),
                SapAction::CancelTimer { key } => {
                    self.timers.cancel(&key);
                }
            }
        }
    }
}

/// Pump PDUs between a service and a data link until either side goes away
///
/// `outbound` is the service's [`ApplicationService::to_network`] receiver.
pub fn bind_datalink<D>(
    datalink: Arc<D>,
    handle: ServiceHandle,
    mut outbound: mpsc::UnboundedReceiver<Pdu>,
) -> JoinHandle<()>
where
    D: DataLink + 'static,
{
    tokio::spawn(async move {
        debug!("data link bound at {}", datalink.local_address());
        loop {
            tokio::select! {
                next = outbound.recv() => {
                    let Some(pdu) = next else {
                        break;
                    };
                    let (frame, destination) = encode_frame(&pdu);
                    if let Err(err) = datalink.send_frame(&frame, &destination).await {
                        warn!("send to {} failed: {}", destination, err);
                    }
                }
                received = datalink.receive_frame() => {
                    match received {
                        Ok((frame, source)) => match decode_frame(&frame, source.clone()) {
                            Ok(Some(pdu)) => {
                                if handle.deliver(pdu).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => trace!("network message from {} skipped", source),
                            Err(err) => debug!("undecodable frame from {}: {}", source, err),
                        },
                        Err(DataLinkError::IoError(err)) => {
                            error!("data link failed: {}", err);
                            break;
                        }
                        Err(err) => debug!("receive error: {}", err),
                    }
                }
            }
        }
        debug!("data link unbound");
    })
}
