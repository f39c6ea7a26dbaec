//! Client side transaction.
//!
//! A [`ClientSsm`] carries one confirmed request from the local application to a peer
//! and the peer's answer back. It segments the request when it does not fit in one
//! APDU, retransmits when the peer stays silent, and reassembles a segmented Complex-ACK.
//!
//! ```text
//!  IDLE --request--> SEGMENTED_REQUEST --all acked--> AWAIT_CONFIRMATION
//!    \                                                   |
//!     `--unsegmented request---------------------------->|
//!                                                        |--segmented ack--> SEGMENTED_CONFIRMATION
//!                                                        v                         |
//!                                                    COMPLETED <-------------------'
//! ```
//!
//! Any state may end in `ABORTED`.

use std::ops::Deref;

use log::{debug, warn};

use crate::app::ssm::{Ssm, SsmAction, SsmState, MAX_SEGMENT_COUNT};
use crate::app::{Apdu, ApplicationConfig, ApplicationError, DeviceInfo, Result};
use crate::network::NetworkAddress;
use crate::service::AbortReason;

/// Transaction for a request this device originates
#[derive(Debug)]
pub struct ClientSsm {
    ssm: Ssm,
}

impl ClientSsm {
    pub fn new(peer: NetworkAddress, config: &ApplicationConfig, device_info: Option<DeviceInfo>) -> Self {
        Self {
            ssm: Ssm::new(false, peer, config, device_info),
        }
    }

    pub fn take_actions(&mut self) -> Vec<SsmAction> {
        self.ssm.take_actions()
    }

    /// Start the transaction with a Confirmed-Request from the application
    pub fn indication(&mut self, apdu: Apdu) -> Result<()> {
        if self.ssm.state != SsmState::Idle {
            return Err(ApplicationError::UnexpectedApdu {
                apdu: apdu.apdu_type(),
                state: self.ssm.state,
            });
        }
        let Apdu::ConfirmedRequest { invoke_id, .. } = &apdu else {
            return Err(ApplicationError::InvalidApdu(format!(
                "client transaction needs a ConfirmedRequest, got {:?}",
                apdu.apdu_type()
            )));
        };
        self.ssm.invoke_id = *invoke_id;
        self.ssm.set_segmentation_context(&apdu)?;

        let local_size = self.ssm.max_apdu_length_accepted.size();
        let segment_size = match &self.ssm.device_info {
            Some(info) => local_size.min(info.deliverable_size()),
            None => local_size,
        };
        let count = self.ssm.plan_segments(segment_size)?;

        if count > 1 {
            if !self.ssm.segmentation_supported.can_transmit() {
                debug!("client {}: request needs {} segments, local device cannot segment", self.ssm.invoke_id, count);
                return self.abort_to_application(AbortReason::SegmentationNotSupported);
            }

            if let Some(info) = &self.ssm.device_info {
                if !info.segmentation_supported.can_receive() {
                    debug!("client {}: {} cannot receive segmented requests", self.ssm.invoke_id, self.ssm.peer);
                    return self.abort_to_application(AbortReason::SegmentationNotSupported);
                }
                if info.max_segments_accepted.count().is_some_and(|max| count > max) {
                    return self.abort_to_application(AbortReason::ApduTooLong);
                }
            }

            if count > MAX_SEGMENT_COUNT {
                return self.abort_to_application(AbortReason::ApduTooLong);
            }

            self.ssm.set_state(SsmState::SegmentedRequest, Some(self.ssm.segment_timeout))?;
        } else {
            self.ssm.set_state(SsmState::AwaitConfirmation, Some(self.ssm.apdu_timeout))?;
        }

        let (first, _) = self.ssm.get_segment(0)?;
        self.ssm.send(first);
        Ok(())
    }

    /// An APDU from the peer for this transaction
    pub fn confirmation(&mut self, apdu: Apdu) -> Result<()> {
        match self.ssm.state {
            SsmState::SegmentedRequest => self.segmented_request(apdu),
            SsmState::AwaitConfirmation => self.await_confirmation(apdu),
            SsmState::SegmentedConfirmation => self.segmented_confirmation(apdu),
            state => Err(ApplicationError::UnexpectedApdu {
                apdu: apdu.apdu_type(),
                state,
            }),
        }
    }

    pub fn timer_expired(&mut self) -> Result<()> {
        self.ssm.timer_fired();
        match self.ssm.state {
            SsmState::SegmentedRequest => self.segmented_request_timeout(),
            SsmState::AwaitConfirmation => self.await_confirmation_timeout(),
            SsmState::SegmentedConfirmation => self.abort_to_application(AbortReason::NoResponse),
            state => {
                debug!("client {}: timer expired in {}", self.ssm.invoke_id, state);
                Ok(())
            }
        }
    }

    /// Send the whole request again from the first segment
    fn retransmit(&mut self) -> Result<()> {
        self.ssm.sent_all_segments = false;
        self.ssm.initial_sequence_number = 0;
        self.ssm.segment_retry_count = 0;
        self.ssm.actual_window_size = None;

        if self.ssm.segment_count == 1 {
            self.ssm.set_state(SsmState::AwaitConfirmation, Some(self.ssm.apdu_timeout))?;
        } else {
            self.ssm.set_state(SsmState::SegmentedRequest, Some(self.ssm.segment_timeout))?;
        }

        let (first, _) = self.ssm.get_segment(0)?;
        self.ssm.send(first);
        Ok(())
    }

    fn segmented_request(&mut self, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck { .. } => {
                if self.ssm.segment_ack_received(&apdu)? {
                    self.ssm.set_state(SsmState::AwaitConfirmation, Some(self.ssm.apdu_timeout))?;
                }
                Ok(())
            }
            Apdu::SimpleAck { .. } | Apdu::ComplexAck { .. } => {
                if self.ssm.sent_all_segments {
                    self.await_confirmation(apdu)
                } else {
                    warn!("client {}: ack before the request was fully sent", self.ssm.invoke_id);
                    self.abort_both(AbortReason::InvalidApduInThisState)
                }
            }
            Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.ssm.set_state(SsmState::Completed, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            Apdu::Abort { .. } => {
                self.ssm.set_state(SsmState::Aborted, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            other => Err(ApplicationError::UnexpectedApdu {
                apdu: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn segmented_request_timeout(&mut self) -> Result<()> {
        if self.ssm.resend_window()? {
            Ok(())
        } else {
            self.abort_to_application(AbortReason::NoResponse)
        }
    }

    fn await_confirmation(&mut self, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::Abort { .. } => {
                self.ssm.set_state(SsmState::Aborted, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.ssm.set_state(SsmState::Completed, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            Apdu::ComplexAck { segmented: false, .. } => {
                self.ssm.set_state(SsmState::Completed, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            Apdu::ComplexAck {
                sequence_number: Some(0),
                ..
            } => {
                if !self.ssm.segmentation_supported.can_receive() {
                    debug!("client {}: segmented ack but local device cannot receive segments", self.ssm.invoke_id);
                    return self.abort_both(AbortReason::SegmentationNotSupported);
                }

                self.ssm.begin_reassembly(&apdu)?;
                self.ssm.set_state(SsmState::SegmentedConfirmation, Some(self.ssm.segment_timeout))?;
                let window = self.ssm.actual_window_size.unwrap_or(1);
                let ack = Apdu::segment_ack(false, false, self.ssm.invoke_id, 0, window);
                self.ssm.send(ack);
                Ok(())
            }
            Apdu::ComplexAck { .. } => {
                warn!("client {}: segmented ack did not start at sequence 0", self.ssm.invoke_id);
                self.abort_both(AbortReason::InvalidApduInThisState)
            }
            Apdu::SegmentAck { .. } => {
                debug!("client {}: ignoring stray segment ack", self.ssm.invoke_id);
                Ok(())
            }
            other => Err(ApplicationError::UnexpectedApdu {
                apdu: other.apdu_type(),
                state: self.ssm.state,
            }),
        }
    }

    fn await_confirmation_timeout(&mut self) -> Result<()> {
        if self.ssm.retry_count < self.ssm.number_of_apdu_retries {
            self.ssm.retry_count += 1;
            debug!(
                "client {}: no reply, retry {}/{}",
                self.ssm.invoke_id, self.ssm.retry_count, self.ssm.number_of_apdu_retries
            );
            self.retransmit()
        } else {
            self.abort_to_application(AbortReason::NoResponse)
        }
    }

    fn segmented_confirmation(&mut self, apdu: Apdu) -> Result<()> {
        match &apdu {
            Apdu::ComplexAck { segmented: true, .. } => {
                if self.ssm.receive_segment(&apdu)? {
                    self.ssm.set_state(SsmState::Completed, None)?;
                    let reassembled = self
                        .ssm
                        .segment_context
                        .as_ref()
                        .ok_or(ApplicationError::NoSegmentationContext)?
                        .reassembled();
                    self.ssm.deliver(reassembled);
                }
                Ok(())
            }
            Apdu::Abort { .. } => {
                self.ssm.set_state(SsmState::Aborted, None)?;
                self.ssm.deliver(apdu);
                Ok(())
            }
            _ => self.abort_both(AbortReason::InvalidApduInThisState),
        }
    }

    fn abort_to_application(&mut self, reason: AbortReason) -> Result<()> {
        let abort = self.ssm.abort(reason)?;
        self.ssm.deliver(abort);
        Ok(())
    }

    fn abort_both(&mut self, reason: AbortReason) -> Result<()> {
        let abort = self.ssm.abort(reason)?;
        self.ssm.send(abort.clone());
        self.ssm.deliver(abort);
        Ok(())
    }
}

impl Deref for ClientSsm {
    type Target = Ssm;

    fn deref(&self) -> &Self::Target {
        &self.ssm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{MaxApduSize, MaxSegments, Segmentation};
    use crate::service::ConfirmedServiceChoice;
    use bytes::Bytes;
    use std::time::Duration;

    const INVOKE_ID: u8 = 7;

    fn peer() -> NetworkAddress {
        NetworkAddress::local(vec![192, 168, 1, 20, 0xBA, 0xC0])
    }

    fn config() -> ApplicationConfig {
        ApplicationConfig::default()
            .with_max_apdu_length_accepted(MaxApduSize::Up50)
            .with_segmentation(Segmentation::Both)
            .with_retries(3)
    }

    fn request(len: usize) -> Apdu {
        Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up50,
            invoke_id: INVOKE_ID,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: ConfirmedServiceChoice::ReadPropertyMultiple,
            service_data: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()),
        }
    }

    fn ack_segment(seq: u8, more_follows: bool, window: u8, data: &[u8]) -> Apdu {
        Apdu::ComplexAck {
            segmented: true,
            more_follows,
            invoke_id: INVOKE_ID,
            sequence_number: Some(seq),
            proposed_window_size: Some(window),
            service_choice: 14,
            service_data: Bytes::copy_from_slice(data),
        }
    }

    fn sent(actions: &[SsmAction]) -> Vec<Apdu> {
        actions
            .iter()
            .filter_map(|action| match action {
                SsmAction::Send(pdu) => Some(pdu.apdu.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[SsmAction]) -> Vec<Apdu> {
        actions
            .iter()
            .filter_map(|action| match action {
                SsmAction::Deliver(pdu) => Some(pdu.apdu.clone()),
                _ => None,
            })
            .collect()
    }

    fn timer_actions(actions: &[SsmAction]) -> Vec<SsmAction> {
        actions
            .iter()
            .filter(|action| matches!(action, SsmAction::StartTimer(_) | SsmAction::StopTimer))
            .cloned()
            .collect()
    }

    fn sequences(apdus: &[Apdu]) -> Vec<u8> {
        apdus.iter().filter_map(Apdu::sequence_number).collect()
    }

    #[test]
    fn test_unsegmented_request_completes() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(10)).unwrap();

        let actions = client.take_actions();
        assert_eq!(client.state(), SsmState::AwaitConfirmation);
        assert_eq!(sent(&actions), vec![request(10)]);
        assert!(actions.contains(&SsmAction::StartTimer(Duration::from_millis(3000))));

        let ack = Apdu::SimpleAck {
            invoke_id: INVOKE_ID,
            service_choice: 14,
        };
        client.confirmation(ack.clone()).unwrap();
        let actions = client.take_actions();
        assert_eq!(client.state(), SsmState::Completed);
        assert_eq!(delivered(&actions), vec![ack]);
        assert!(actions.contains(&SsmAction::StopTimer));
    }

    #[test]
    fn test_rejects_non_request_indication() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        let result = client.indication(Apdu::abort(false, 1, AbortReason::Other));
        assert!(matches!(result, Err(ApplicationError::InvalidApdu(_))));
        assert_eq!(client.state(), SsmState::Idle);
    }

    #[test]
    fn test_retries_exactly_configured_times() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(10)).unwrap();
        let mut transmissions = sent(&client.take_actions()).len();

        for _ in 0..3 {
            client.timer_expired().unwrap();
            let actions = client.take_actions();
            transmissions += sent(&actions).len();
            assert_eq!(client.state(), SsmState::AwaitConfirmation);
        }
        assert_eq!(transmissions, 4);

        client.timer_expired().unwrap();
        let actions = client.take_actions();
        assert!(sent(&actions).is_empty());
        assert_eq!(client.state(), SsmState::Aborted);
        match delivered(&actions).as_slice() {
            [Apdu::Abort {
                server,
                abort_reason,
                invoke_id,
            }] => {
                assert!(!server);
                assert_eq!(*invoke_id, INVOKE_ID);
                assert_eq!(*abort_reason, AbortReason::NoResponse);
            }
            other => panic!("Expected NoResponse abort, got {:?}", other),
        }
    }

    #[test]
    fn test_local_device_cannot_segment() {
        let config = config().with_segmentation(Segmentation::Receive);
        let mut client = ClientSsm::new(peer(), &config, None);
        client.indication(request(120)).unwrap();

        let actions = client.take_actions();
        assert!(sent(&actions).is_empty());
        assert_eq!(client.state(), SsmState::Aborted);
        match delivered(&actions).as_slice() {
            [Apdu::Abort { abort_reason, .. }] => {
                assert_eq!(*abort_reason, AbortReason::SegmentationNotSupported)
            }
            other => panic!("Expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_cannot_receive_segments() {
        let info = DeviceInfo::new(MaxApduSize::Up480, Segmentation::Transmit);
        let mut client = ClientSsm::new(peer(), &config(), Some(info));
        client.indication(request(120)).unwrap();

        let actions = client.take_actions();
        assert!(sent(&actions).is_empty());
        match delivered(&actions).as_slice() {
            [Apdu::Abort { abort_reason, .. }] => {
                assert_eq!(*abort_reason, AbortReason::SegmentationNotSupported)
            }
            other => panic!("Expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_segment_limit() {
        let info =
            DeviceInfo::new(MaxApduSize::Up480, Segmentation::Both).with_max_segments(MaxSegments::Two);
        let mut client = ClientSsm::new(peer(), &config(), Some(info));
        client.indication(request(120)).unwrap();

        match delivered(&client.take_actions()).as_slice() {
            [Apdu::Abort { abort_reason, .. }] => assert_eq!(*abort_reason, AbortReason::ApduTooLong),
            other => panic!("Expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_segment_size_follows_peer() {
        let config = config().with_max_apdu_length_accepted(MaxApduSize::Up480);
        let info = DeviceInfo::new(MaxApduSize::Up206, Segmentation::Both);
        let mut client = ClientSsm::new(peer(), &config, Some(info));
        client.indication(request(300)).unwrap();

        assert_eq!(client.segment_size(), 206);
        assert_eq!(client.segment_count(), 2);
        assert_eq!(client.state(), SsmState::SegmentedRequest);
    }

    #[test]
    fn test_segmented_request_windowing() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(120)).unwrap();

        let actions = client.take_actions();
        assert_eq!(client.segment_count(), 3);
        assert_eq!(client.state(), SsmState::SegmentedRequest);
        assert_eq!(sequences(&sent(&actions)), vec![0]);
        assert!(actions.contains(&SsmAction::StartTimer(Duration::from_millis(1500))));

        client
            .confirmation(Apdu::segment_ack(false, true, INVOKE_ID, 0, 2))
            .unwrap();
        assert_eq!(sequences(&sent(&client.take_actions())), vec![1, 2]);
        assert_eq!(client.actual_window_size(), Some(2));
        assert_eq!(client.state(), SsmState::SegmentedRequest);

        client
            .confirmation(Apdu::segment_ack(false, true, INVOKE_ID, 2, 2))
            .unwrap();
        assert!(sent(&client.take_actions()).is_empty());
        assert_eq!(client.state(), SsmState::AwaitConfirmation);
    }

    #[test]
    fn test_segment_timeout_resumes_from_acked_window() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(250)).unwrap();
        assert_eq!(client.segment_count(), 5);
        client.take_actions();

        client
            .confirmation(Apdu::segment_ack(false, true, INVOKE_ID, 0, 2))
            .unwrap();
        assert_eq!(sequences(&sent(&client.take_actions())), vec![1, 2]);

        client
            .confirmation(Apdu::segment_ack(false, true, INVOKE_ID, 1, 2))
            .unwrap();
        assert_eq!(sequences(&sent(&client.take_actions())), vec![2, 3]);

        client.timer_expired().unwrap();
        assert_eq!(sequences(&sent(&client.take_actions())), vec![2, 3]);
        assert_eq!(client.state(), SsmState::SegmentedRequest);
    }

    #[test]
    fn test_stale_segment_ack_only_restarts_timer() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(250)).unwrap();
        client
            .confirmation(Apdu::segment_ack(false, true, INVOKE_ID, 0, 2))
            .unwrap();
        client.take_actions();

        client
            .confirmation(Apdu::segment_ack(true, true, INVOKE_ID, 0, 2))
            .unwrap();
        let actions = client.take_actions();
        assert!(sent(&actions).is_empty());
        assert!(actions.contains(&SsmAction::StartTimer(Duration::from_millis(1500))));
    }

    #[test]
    fn test_segment_retries_exhausted() {
        let mut client = ClientSsm::new(peer(), &config().with_retries(1), None);
        client.indication(request(120)).unwrap();
        client.take_actions();

        client.timer_expired().unwrap();
        assert_eq!(sequences(&sent(&client.take_actions())), vec![0]);

        client.timer_expired().unwrap();
        let actions = client.take_actions();
        assert_eq!(client.state(), SsmState::Aborted);
        match delivered(&actions).as_slice() {
            [Apdu::Abort { abort_reason, .. }] => assert_eq!(*abort_reason, AbortReason::NoResponse),
            other => panic!("Expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_early_ack_aborts_both_ways() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(120)).unwrap();
        client.take_actions();

        client
            .confirmation(Apdu::SimpleAck {
                invoke_id: INVOKE_ID,
                service_choice: 14,
            })
            .unwrap();
        let actions = client.take_actions();
        let expected = Apdu::abort(false, INVOKE_ID, AbortReason::InvalidApduInThisState);
        assert_eq!(sent(&actions), vec![expected.clone()]);
        assert_eq!(delivered(&actions), vec![expected]);
        assert_eq!(client.state(), SsmState::Aborted);
    }

    #[test]
    fn test_segmented_confirmation_reassembles() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(10)).unwrap();
        client.take_actions();

        client.confirmation(ack_segment(0, true, 3, &[0, 1])).unwrap();
        assert_eq!(client.state(), SsmState::SegmentedConfirmation);
        assert_eq!(
            sent(&client.take_actions()),
            vec![Apdu::segment_ack(false, false, INVOKE_ID, 0, 2)]
        );

        client.confirmation(ack_segment(1, true, 3, &[2, 3])).unwrap();
        assert!(sent(&client.take_actions()).is_empty());

        client.confirmation(ack_segment(2, true, 3, &[4, 5])).unwrap();
        assert_eq!(
            sent(&client.take_actions()),
            vec![Apdu::segment_ack(false, false, INVOKE_ID, 2, 2)]
        );

        client.confirmation(ack_segment(3, false, 3, &[6])).unwrap();
        let actions = client.take_actions();
        assert_eq!(
            sent(&actions),
            vec![Apdu::segment_ack(false, false, INVOKE_ID, 3, 2)]
        );
        assert_eq!(client.state(), SsmState::Completed);
        match delivered(&actions).as_slice() {
            [Apdu::ComplexAck {
                segmented,
                service_data,
                service_choice,
                ..
            }] => {
                assert!(!segmented);
                assert_eq!(*service_choice, 14);
                assert_eq!(&service_data[..], &[0, 1, 2, 3, 4, 5, 6]);
            }
            other => panic!("Expected reassembled ComplexAck, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_segment_is_nacked() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(10)).unwrap();
        client.confirmation(ack_segment(0, true, 2, &[0])).unwrap();
        client.take_actions();

        client.confirmation(ack_segment(2, true, 2, &[2])).unwrap();
        let actions = client.take_actions();
        assert_eq!(
            sent(&actions),
            vec![Apdu::segment_ack(true, false, INVOKE_ID, 0, 2)]
        );
        assert_eq!(
            timer_actions(&actions),
            vec![
                SsmAction::StopTimer,
                SsmAction::StartTimer(config().segment_timeout)
            ]
        );
        assert_eq!(client.state(), SsmState::SegmentedConfirmation);
        assert_eq!(client.segment_context().unwrap().service_bytes(), &[0]);
    }

    #[test]
    fn test_segmented_ack_needs_local_receive_support() {
        let config = config().with_segmentation(Segmentation::Transmit);
        let mut client = ClientSsm::new(peer(), &config, None);
        client.indication(request(10)).unwrap();
        client.take_actions();

        client.confirmation(ack_segment(0, true, 2, &[0])).unwrap();
        let actions = client.take_actions();
        let expected = Apdu::abort(false, INVOKE_ID, AbortReason::SegmentationNotSupported);
        assert_eq!(sent(&actions), vec![expected.clone()]);
        assert_eq!(delivered(&actions), vec![expected]);
    }

    #[test]
    fn test_no_events_after_completion() {
        let mut client = ClientSsm::new(peer(), &config(), None);
        client.indication(request(10)).unwrap();
        client
            .confirmation(Apdu::Reject {
                invoke_id: INVOKE_ID,
                reject_reason: crate::service::RejectReason::Other,
            })
            .unwrap();
        assert!(client.is_terminal());

        let result = client.confirmation(Apdu::SimpleAck {
            invoke_id: INVOKE_ID,
            service_choice: 14,
        });
        assert!(matches!(result, Err(ApplicationError::UnexpectedApdu { .. })));
    }
}
