//! Server side transaction.
//!
//! A [`ServerSsm`] answers one confirmed request received from a peer. It reassembles a
//! segmented request before the application sees it, then segments the application's
//! Complex-ACK when the answer is larger than the client can take in one APDU.
//!
//! Packets from the peer enter through [`ServerSsm::indication`], the application's
//! answer through [`ServerSsm::confirmation`].

use std::ops::Deref;

use log::{debug, warn};

use crate::app::ssm::{Ssm, SsmAction, SsmState, MAX_SEGMENT_COUNT};
use crate::app::{
    Apdu, ApplicationConfig, ApplicationError, DeviceInfo, DeviceInfoCache, MaxSegments, Result,
};
use crate::network::NetworkAddress;
use crate::service::AbortReason;

/// Transaction for a request received from a peer
#[derive(Debug)]
pub struct ServerSsm {
    ssm: Ssm,
    device_cache: DeviceInfoCache,
    segmented_response_accepted: bool,
    client_max_segments: MaxSegments,
    /// Largest APDU the client takes, learned from its request
    client_max_apdu: usize,
}

impl ServerSsm {
    pub fn new(
        peer: NetworkAddress,
        config: &ApplicationConfig,
        device_cache: DeviceInfoCache,
    ) -> Self {
        let device_info = device_cache.get(&peer);
        Self {
            ssm: Ssm::new(true, peer, config, device_info),
            device_cache,
            segmented_response_accepted: false,
            client_max_segments: MaxSegments::Unspecified,
            client_max_apdu: config.max_apdu_length_accepted.size(),
        }
    }

    pub fn take_actions(&mut self) -> Vec<SsmAction> {
        self.ssm.take_actions()
    }

    pub fn segmented_response_accepted(&self) -> bool {
        self.segmented_response_accepted
    }

    /// An APDU from the client device
    pub fn indication(&mut self, apdu: Apdu) -> Result<()> {
        match self.ssm.state {
            SsmState::Idle => self.idle(apdu),
            SsmState::SegmentedRequest => self.segmented_request(apdu),
            SsmState::AwaitResponse => self.await_response(apdu),
            SsmState::SegmentedResponse => self.segmented_response(apdu),
            state => Err(ApplicationError::UnexpectedApdu {
                apdu: apdu.apdu_type(),
                state,
            }),
        }
    }

    /// The application's answer to the request
    pub fn confirmation(&mut self, apdu: Apdu) -> Result<()> {
        if let Apdu::Abort { .. } = apdu {
            self.ssm.set_state(SsmState::Aborted, None)?;
            self.ssm.send(apdu);
            return Ok(());
        }

        if self.ssm.state != SsmState::AwaitResponse {
            return Err(ApplicationError::UnexpectedApdu {
                apdu: apdu.apdu_type(),
                state: self.ssm.state,
            });
        }

        match apdu {
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.ssm.set_state(SsmState::Completed, None)?;
                self.ssm.send(apdu);
                Ok(())
            }
            Apdu::ComplexAck { .. } => self.respond(apdu),
            other => Err(ApplicationError::InvalidApdu(format!(
                "{:?} is not a response to a confirmed request",
                other.apdu_type()
            ))),
        }
    }

    pub fn timer_expired(&mut self) -> Result<()> {
        self.ssm.timer_fired();
        match self.ssm.state {
            SsmState::SegmentedRequest => {
                debug!("server {}: client stopped sending segments", self.ssm.invoke_id);
                self.ssm.set_state(SsmState::Aborted, None)
            }
            SsmState::AwaitResponse => {
                warn!("server {}: application did not answer in time", self.ssm.invoke_id);
                let abort = self.ssm.abort(AbortReason::ServerTimeout)?;
                self.ssm.deliver(abort);
                Ok(())
            }
            SsmState::SegmentedResponse => {
                if !self.ssm.resend_window()? {
                    debug!("server {}: segment retries exhausted", self.ssm.invoke_id);
                    self.ssm.set_state(SsmState::Aborted, None)?;
                }
                Ok(())
            }
            state => {
                debug!("server {}: timer expired in {}", self.ssm.invoke_id, state);
                Ok(())
            }
        }
    }

    fn idle(&mut self, apdu: Apdu) -> Result<()> {
        let Apdu::ConfirmedRequest {
            invoke_id,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            segmented,
            ..
        } = &apdu
        else {
            return Err(ApplicationError::InvalidApdu(format!(
                "server transaction starts with a ConfirmedRequest, got {:?}",
                apdu.apdu_type()
            )));
        };

        self.ssm.invoke_id = *invoke_id;
        self.segmented_response_accepted = *segmented_response_accepted;
        self.client_max_segments = *max_segments;
        if *segmented_response_accepted {
            if let Some(info) = self
                .device_cache
                .note_segmented_response_accepted(&self.ssm.peer)
            {
                self.ssm.device_info = Some(info);
            }
        }

        self.client_max_apdu = match &self.ssm.device_info {
            Some(info) => max_response_size
                .size()
                .min(info.max_apdu_length_accepted.size()),
            None => max_response_size.size(),
        };

        if !*segmented {
            self.ssm
                .set_state(SsmState::AwaitResponse, Some(self.ssm.application_timeout))?;
            self.ssm.deliver(apdu);
            return Ok(());
        }

        if !self.ssm.segmentation_supported.can_receive() {
            debug!(
                "server {}: segmented request but local device cannot receive segments",
                self.ssm.invoke_id
            );
            let abort = self.ssm.abort(AbortReason::SegmentationNotSupported)?;
            self.ssm.send(abort);
            return Ok(());
        }

        self.ssm.begin_reassembly(&apdu)?;
        self.ssm
            .set_state(SsmState::SegmentedRequest, Some(self.ssm.segment_timeout))?;
        let window = self.ssm.actual_window_size.unwrap_or(1);
        let ack = Apdu::segment_ack(false, true, self.ssm.invoke_id, 0, window);
        self.ssm.send(ack);
        Ok(())
    }

    fn segmented_request(&mut self, apdu: Apdu) -> Result<()> {
        match &apdu {
            Apdu::Abort { .. } => self.ssm.set_state(SsmState::Aborted, None),
            Apdu::ConfirmedRequest { segmented: true, .. } => {
                if self.ssm.receive_segment(&apdu)? {
                    self.ssm
                        .set_state(SsmState::AwaitResponse, Some(self.ssm.application_timeout))?;
                    let request = self
                        .ssm
                        .segment_context
                        .as_ref()
                        .ok_or(ApplicationError::NoSegmentationContext)?
                        .reassembled();
                    self.ssm.deliver(request);
                }
                Ok(())
            }
            _ => {
                warn!(
                    "server {}: {:?} while receiving segments",
                    self.ssm.invoke_id,
                    apdu.apdu_type()
                );
                let abort = self.ssm.abort(AbortReason::InvalidApduInThisState)?;
                self.ssm.send(abort.clone());
                self.ssm.deliver(abort);
                Ok(())
            }
        }
    }

    fn await_response(&mut self, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::ConfirmedRequest { .. } => {
                debug!(
                    "server {}: duplicate request while the application works on it",
                    self.ssm.invoke_id
                );
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

    fn segmented_response(&mut self, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck { .. } => {
                if self.ssm.segment_ack_received(&apdu)? {
                    self.ssm.set_state(SsmState::Completed, None)?;
                }
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

    /// Send a Complex-ACK, segmenting it when it exceeds what the client takes
    fn respond(&mut self, apdu: Apdu) -> Result<()> {
        self.ssm.set_segmentation_context(&apdu)?;

        let segment_size = match self
            .ssm
            .device_info
            .as_ref()
            .and_then(|info| info.max_npdu_length)
        {
            Some(npdu) => npdu.min(self.client_max_apdu),
            None => self.client_max_apdu,
        };
        let count = self.ssm.plan_segments(segment_size)?;

        if count == 1 {
            self.ssm.set_state(SsmState::Completed, None)?;
            let (only, _) = self.ssm.get_segment(0)?;
            self.ssm.send(only);
            return Ok(());
        }

        let reason = if !self.ssm.segmentation_supported.can_transmit()
            || !self.segmented_response_accepted
        {
            Some(AbortReason::SegmentationNotSupported)
        } else if count > MAX_SEGMENT_COUNT
            || self.client_max_segments.count().is_some_and(|max| count > max)
        {
            Some(AbortReason::ApduTooLong)
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!(
                "server {}: cannot send {} segment response to {}",
                self.ssm.invoke_id, count, self.ssm.peer
            );
            let abort = self.ssm.abort(reason)?;
            self.ssm.send(abort);
            return Ok(());
        }

        self.ssm.sent_all_segments = false;
        self.ssm.initial_sequence_number = 0;
        self.ssm.segment_retry_count = 0;
        self.ssm.actual_window_size = None;
        self.ssm
            .set_state(SsmState::SegmentedResponse, Some(self.ssm.segment_timeout))?;
        let (first, _) = self.ssm.get_segment(0)?;
        self.ssm.send(first);
        Ok(())
    }

    /// Capabilities recorded for the client when the request arrived
    pub fn client_info(&self) -> Option<&DeviceInfo> {
        self.ssm.device_info.as_ref()
    }
}

impl Deref for ServerSsm {
    type Target = Ssm;

    fn deref(&self) -> &Self::Target {
        &self.ssm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{MaxApduSize, Segmentation};
    use crate::service::ConfirmedServiceChoice;
    use bytes::Bytes;
    use std::time::Duration;

    const INVOKE_ID: u8 = 42;

    fn peer() -> NetworkAddress {
        NetworkAddress::local(vec![192, 168, 1, 30, 0xBA, 0xC0])
    }

    fn config() -> ApplicationConfig {
        ApplicationConfig::default()
            .with_segmentation(Segmentation::Both)
            .with_application_timeout(Duration::from_secs(5))
    }

    fn request(segmented: Option<(u8, bool)>, accepted: bool, data: &[u8]) -> Apdu {
        Apdu::ConfirmedRequest {
            segmented: segmented.is_some(),
            more_follows: segmented.is_some_and(|(_, more)| more),
            segmented_response_accepted: accepted,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up50,
            invoke_id: INVOKE_ID,
            sequence_number: segmented.map(|(seq, _)| seq),
            proposed_window_size: segmented.map(|_| 2),
            service_choice: ConfirmedServiceChoice::WriteProperty,
            service_data: Bytes::copy_from_slice(data),
        }
    }

    fn complex_ack(len: usize) -> Apdu {
        Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id: INVOKE_ID,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()),
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

    fn server() -> ServerSsm {
        ServerSsm::new(peer(), &config(), DeviceInfoCache::new())
    }

    #[test]
    fn test_unsegmented_request_and_simple_ack() {
        let mut server = server();
        server.indication(request(None, false, &[1, 2, 3])).unwrap();

        let actions = server.take_actions();
        assert_eq!(server.state(), SsmState::AwaitResponse);
        assert_eq!(delivered(&actions), vec![request(None, false, &[1, 2, 3])]);
        assert!(actions.contains(&SsmAction::StartTimer(Duration::from_secs(5))));

        let ack = Apdu::SimpleAck {
            invoke_id: INVOKE_ID,
            service_choice: 15,
        };
        server.confirmation(ack.clone()).unwrap();
        assert_eq!(sent(&server.take_actions()), vec![ack]);
        assert_eq!(server.state(), SsmState::Completed);
    }

    #[test]
    fn test_segmented_request_reassembly() {
        let mut server = server();
        server
            .indication(request(Some((0, true)), false, &[0, 1]))
            .unwrap();
        assert_eq!(server.state(), SsmState::SegmentedRequest);
        assert_eq!(
            sent(&server.take_actions()),
            vec![Apdu::segment_ack(false, true, INVOKE_ID, 0, 2)]
        );

        server
            .indication(request(Some((1, true)), false, &[2, 3]))
            .unwrap();
        assert!(sent(&server.take_actions()).is_empty());

        server
            .indication(request(Some((2, true)), false, &[4, 5]))
            .unwrap();
        assert_eq!(
            sent(&server.take_actions()),
            vec![Apdu::segment_ack(false, true, INVOKE_ID, 2, 2)]
        );

        server
            .indication(request(Some((3, false)), false, &[6]))
            .unwrap();
        let actions = server.take_actions();
        assert_eq!(
            sent(&actions),
            vec![Apdu::segment_ack(false, true, INVOKE_ID, 3, 2)]
        );
        assert_eq!(server.state(), SsmState::AwaitResponse);
        match delivered(&actions).as_slice() {
            [Apdu::ConfirmedRequest {
                segmented,
                service_data,
                service_choice,
                ..
            }] => {
                assert!(!segmented);
                assert_eq!(*service_choice, ConfirmedServiceChoice::WriteProperty);
                assert_eq!(&service_data[..], &[0, 1, 2, 3, 4, 5, 6]);
            }
            other => panic!("Expected reassembled request, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_segment() {
        let mut server = server();
        server
            .indication(request(Some((0, true)), false, &[0]))
            .unwrap();
        server.take_actions();

        server
            .indication(request(Some((2, true)), false, &[2]))
            .unwrap();
        let actions = server.take_actions();
        assert_eq!(
            sent(&actions),
            vec![Apdu::segment_ack(true, true, INVOKE_ID, 0, 2)]
        );
        assert_eq!(
            timer_actions(&actions),
            vec![
                SsmAction::StopTimer,
                SsmAction::StartTimer(config().segment_timeout)
            ]
        );
        assert!(delivered(&actions).is_empty());
        assert_eq!(server.state(), SsmState::SegmentedRequest);
        assert_eq!(server.segment_context().unwrap().service_bytes(), &[0]);

        server
            .indication(request(Some((1, false)), false, &[1]))
            .unwrap();
        match delivered(&server.take_actions()).as_slice() {
            [apdu] => assert_eq!(apdu.service_data().unwrap().as_ref(), &[0, 1]),
            other => panic!("Expected one delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_segmented_request_without_local_support() {
        let config = config().with_segmentation(Segmentation::Transmit);
        let mut server = ServerSsm::new(peer(), &config, DeviceInfoCache::new());
        server
            .indication(request(Some((0, true)), false, &[0]))
            .unwrap();

        let actions = server.take_actions();
        assert!(delivered(&actions).is_empty());
        assert_eq!(
            sent(&actions),
            vec![Apdu::abort(
                true,
                INVOKE_ID,
                AbortReason::SegmentationNotSupported
            )]
        );
        assert_eq!(server.state(), SsmState::Aborted);
    }

    #[test]
    fn test_unsegmented_apdu_during_reassembly() {
        let mut server = server();
        server
            .indication(request(Some((0, true)), false, &[0]))
            .unwrap();
        server.take_actions();

        server.indication(request(None, false, &[9])).unwrap();
        let actions = server.take_actions();
        let expected = Apdu::abort(true, INVOKE_ID, AbortReason::InvalidApduInThisState);
        assert_eq!(sent(&actions), vec![expected.clone()]);
        assert_eq!(delivered(&actions), vec![expected]);
    }

    #[test]
    fn test_segmented_response() {
        let mut server = server();
        server.indication(request(None, true, &[1])).unwrap();
        server.take_actions();

        server.confirmation(complex_ack(120)).unwrap();
        let actions = server.take_actions();
        assert_eq!(server.segment_count(), 3);
        assert_eq!(server.state(), SsmState::SegmentedResponse);
        match sent(&actions).as_slice() {
            [Apdu::ComplexAck {
                segmented,
                more_follows,
                sequence_number,
                proposed_window_size,
                service_data,
                ..
            }] => {
                assert!(segmented);
                assert!(more_follows);
                assert_eq!(*sequence_number, Some(0));
                assert_eq!(*proposed_window_size, Some(2));
                assert_eq!(service_data.len(), 50);
            }
            other => panic!("Expected first segment, got {:?}", other),
        }

        server
            .indication(Apdu::segment_ack(false, false, INVOKE_ID, 0, 2))
            .unwrap();
        let seqs: Vec<_> = sent(&server.take_actions())
            .iter()
            .filter_map(Apdu::sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 2]);

        server
            .indication(Apdu::segment_ack(false, false, INVOKE_ID, 2, 2))
            .unwrap();
        assert_eq!(server.state(), SsmState::Completed);
    }

    #[test]
    fn test_segmented_response_not_accepted() {
        let mut server = server();
        server.indication(request(None, false, &[1])).unwrap();
        server.take_actions();

        server.confirmation(complex_ack(120)).unwrap();
        assert_eq!(
            sent(&server.take_actions()),
            vec![Apdu::abort(
                true,
                INVOKE_ID,
                AbortReason::SegmentationNotSupported
            )]
        );
        assert_eq!(server.state(), SsmState::Aborted);
    }

    #[test]
    fn test_response_exceeds_client_segments() {
        let mut server = server();
        let mut apdu = request(None, true, &[1]);
        if let Apdu::ConfirmedRequest { max_segments, .. } = &mut apdu {
            *max_segments = MaxSegments::Two;
        }
        server.indication(apdu).unwrap();
        server.take_actions();

        server.confirmation(complex_ack(120)).unwrap();
        assert_eq!(
            sent(&server.take_actions()),
            vec![Apdu::abort(true, INVOKE_ID, AbortReason::ApduTooLong)]
        );
    }

    #[test]
    fn test_application_timeout() {
        let mut server = server();
        server.indication(request(None, false, &[1])).unwrap();
        server.take_actions();

        server.timer_expired().unwrap();
        let actions = server.take_actions();
        assert!(sent(&actions).is_empty());
        assert_eq!(
            delivered(&actions),
            vec![Apdu::abort(true, INVOKE_ID, AbortReason::ServerTimeout)]
        );
        assert_eq!(server.state(), SsmState::Aborted);
    }

    #[test]
    fn test_response_segment_retries() {
        let config = config().with_retries(1);
        let mut server = ServerSsm::new(peer(), &config, DeviceInfoCache::new());
        server.indication(request(None, true, &[1])).unwrap();
        server.confirmation(complex_ack(120)).unwrap();
        server.take_actions();

        server.timer_expired().unwrap();
        assert_eq!(sent(&server.take_actions()).len(), 1);
        assert_eq!(server.state(), SsmState::SegmentedResponse);

        server.timer_expired().unwrap();
        assert!(sent(&server.take_actions()).is_empty());
        assert_eq!(server.state(), SsmState::Aborted);
    }

    #[test]
    fn test_request_updates_device_cache() {
        let cache = DeviceInfoCache::new();
        cache.update(
            peer(),
            DeviceInfo::new(MaxApduSize::Up206, Segmentation::NoSegmentation),
        );

        let mut server = ServerSsm::new(peer(), &config(), cache.clone());
        let mut apdu = request(None, true, &[1]);
        if let Apdu::ConfirmedRequest {
            max_response_size, ..
        } = &mut apdu
        {
            *max_response_size = MaxApduSize::Up1476;
        }
        server.indication(apdu).unwrap();

        assert_eq!(
            cache.get(&peer()).unwrap().segmentation_supported,
            Segmentation::Receive
        );
        assert_eq!(
            server.client_info().unwrap().segmentation_supported,
            Segmentation::Receive
        );

        server.confirmation(complex_ack(300)).unwrap();
        assert_eq!(server.segment_size(), 206);
        assert_eq!(server.segment_count(), 2);
    }

    #[test]
    fn test_duplicate_request_is_ignored() {
        let mut server = server();
        server.indication(request(None, false, &[1])).unwrap();
        server.take_actions();

        server.indication(request(None, false, &[1])).unwrap();
        assert!(server.take_actions().is_empty());
        assert_eq!(server.state(), SsmState::AwaitResponse);
    }
}
