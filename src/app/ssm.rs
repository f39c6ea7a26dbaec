//! Segmentation state machine core.
//!
//! [`Ssm`] holds what client and server transactions have in common: identity, the
//! segmentation context, window bookkeeping, retry counters and the timer. It performs
//! no IO. Every outbound PDU and timer request is pushed as an [`SsmAction`] and drained
//! by the owning access point after each event.
//!
//! Sequence numbers are octets and compare modulo 256. A segment count is kept at or
//! below 255 so a sequence number identifies one segment within a transaction.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};

use crate::app::{
    Apdu, ApplicationConfig, ApplicationError, DeviceInfo, MaxApduSize, MaxSegments, Pdu, Result,
    Segmentation,
};
use crate::network::NetworkAddress;
use crate::service::AbortReason;

/// Largest number of segments one message may be split into
pub const MAX_SEGMENT_COUNT: usize = 255;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsmState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl SsmState {
    /// `Completed` and `Aborted` admit no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, SsmState::Completed | SsmState::Aborted)
    }
}

impl fmt::Display for SsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SsmState::Idle => "IDLE",
            SsmState::SegmentedRequest => "SEGMENTED_REQUEST",
            SsmState::AwaitConfirmation => "AWAIT_CONFIRMATION",
            SsmState::AwaitResponse => "AWAIT_RESPONSE",
            SsmState::SegmentedResponse => "SEGMENTED_RESPONSE",
            SsmState::SegmentedConfirmation => "SEGMENTED_CONFIRMATION",
            SsmState::Completed => "COMPLETED",
            SsmState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Side effect requested by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsmAction {
    /// Send toward the peer device
    Send(Pdu),
    /// Hand to the local application
    Deliver(Pdu),
    /// Arm the transaction timer, replacing any pending one
    StartTimer(Duration),
    /// Cancel the pending timer
    StopTimer,
}

/// True when `seq_a` is one of the `window` sequence numbers starting at `seq_b`
pub fn in_window(seq_a: u8, seq_b: u8, window: u8) -> bool {
    seq_a.wrapping_sub(seq_b) < window
}

/// Service data of a (to be) segmented message and the APDU it belongs to
#[derive(Debug, Clone)]
pub struct SegmentationContext {
    original: Apdu,
    invoke_id: u8,
    service_choice: u8,
    is_ack: bool,
    service_bytes: BytesMut,
}

impl SegmentationContext {
    /// Context for an unsegmented Confirmed-Request or Complex-ACK
    pub fn new(apdu: &Apdu) -> Result<Self> {
        if apdu.is_segmented() || apdu.more_follows() {
            return Err(ApplicationError::InvalidApdu(
                "segmentation context needs an unsegmented APDU".to_string(),
            ));
        }

        let (invoke_id, service_choice, is_ack, data) = match apdu {
            Apdu::ConfirmedRequest {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => (*invoke_id, *service_choice as u8, false, service_data),
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => (*invoke_id, *service_choice, true, service_data),
            other => {
                return Err(ApplicationError::InvalidApdu(format!(
                    "{:?} carries no segmentable service data",
                    other.apdu_type()
                )))
            }
        };

        Ok(Self {
            original: apdu.clone(),
            invoke_id,
            service_choice,
            is_ack,
            service_bytes: BytesMut::from(&data[..]),
        })
    }

    pub fn original(&self) -> &Apdu {
        &self.original
    }

    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    pub fn service_choice(&self) -> u8 {
        self.service_choice
    }

    /// Complex-ACK context rather than Confirmed-Request
    pub fn is_ack(&self) -> bool {
        self.is_ack
    }

    pub fn service_bytes(&self) -> &[u8] {
        &self.service_bytes
    }

    pub fn len(&self) -> usize {
        self.service_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.service_bytes.is_empty()
    }

    /// Append the service data of a chunk stripped with [`Apdu::without_segmentation`]
    pub fn append(&mut self, chunk: &Apdu) -> Result<()> {
        if chunk.is_segmented() || chunk.more_follows() {
            return Err(ApplicationError::InvalidApdu(
                "segment header must be stripped before appending".to_string(),
            ));
        }

        match (chunk, self.is_ack) {
            (Apdu::ComplexAck { service_data, .. }, true)
            | (Apdu::ConfirmedRequest { service_data, .. }, false) => {
                self.service_bytes.extend_from_slice(service_data);
                Ok(())
            }
            (other, _) => Err(ApplicationError::InvalidApdu(format!(
                "{:?} does not belong to this segmentation context",
                other.apdu_type()
            ))),
        }
    }

    /// The original APDU carrying all service bytes gathered so far
    pub fn reassembled(&self) -> Apdu {
        let mut apdu = self.original.clone();
        if let Apdu::ConfirmedRequest { service_data, .. } | Apdu::ComplexAck { service_data, .. } =
            &mut apdu
        {
            *service_data = Bytes::copy_from_slice(&self.service_bytes);
        }
        apdu
    }
}

/// State shared by client and server transactions
#[derive(Debug)]
pub struct Ssm {
    /// Server side of the transaction; sets the "server" flag on Abort and Segment-ACK
    pub(crate) server: bool,
    pub(crate) invoke_id: u8,
    pub(crate) peer: NetworkAddress,
    pub(crate) device_info: Option<DeviceInfo>,

    pub(crate) state: SsmState,
    pub(crate) segment_context: Option<SegmentationContext>,
    pub(crate) segment_size: usize,
    pub(crate) segment_count: usize,

    pub(crate) retry_count: u8,
    pub(crate) segment_retry_count: u8,
    pub(crate) sent_all_segments: bool,
    pub(crate) last_sequence_number: u8,
    pub(crate) initial_sequence_number: u8,
    pub(crate) actual_window_size: Option<u8>,

    pub(crate) number_of_apdu_retries: u8,
    pub(crate) apdu_timeout: Duration,
    pub(crate) segment_timeout: Duration,
    pub(crate) application_timeout: Duration,
    pub(crate) segmentation_supported: Segmentation,
    pub(crate) max_segments_accepted: MaxSegments,
    pub(crate) max_apdu_length_accepted: MaxApduSize,
    pub(crate) proposed_window_size: u8,

    timer_armed: bool,
    actions: Vec<SsmAction>,
}

impl Ssm {
    pub fn new(
        server: bool,
        peer: NetworkAddress,
        config: &ApplicationConfig,
        device_info: Option<DeviceInfo>,
    ) -> Self {
        Self {
            server,
            invoke_id: 0,
            peer,
            device_info,
            state: SsmState::Idle,
            segment_context: None,
            segment_size: config.max_apdu_length_accepted.size(),
            segment_count: 0,
            retry_count: 0,
            segment_retry_count: 0,
            sent_all_segments: false,
            last_sequence_number: 0,
            initial_sequence_number: 0,
            actual_window_size: None,
            number_of_apdu_retries: config.number_of_apdu_retries,
            apdu_timeout: config.apdu_timeout,
            segment_timeout: config.segment_timeout,
            application_timeout: config.application_timeout,
            segmentation_supported: config.segmentation_supported,
            max_segments_accepted: config.max_segments_accepted,
            max_apdu_length_accepted: config.max_apdu_length_accepted,
            proposed_window_size: config.proposed_window_size.max(1),
            timer_armed: false,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> SsmState {
        self.state
    }

    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    pub fn peer(&self) -> &NetworkAddress {
        &self.peer
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segment_context(&self) -> Option<&SegmentationContext> {
        self.segment_context.as_ref()
    }

    pub fn actual_window_size(&self) -> Option<u8> {
        self.actual_window_size
    }

    /// Drain the actions produced since the last call
    pub fn take_actions(&mut self) -> Vec<SsmAction> {
        std::mem::take(&mut self.actions)
    }

    /// Queue an APDU for the peer
    pub(crate) fn send(&mut self, apdu: Apdu) {
        trace!("ssm {} -> {}: {:?}", self.invoke_id, self.peer, apdu.apdu_type());
        self.actions.push(SsmAction::Send(Pdu::to(self.peer.clone(), apdu)));
    }

    /// Queue an APDU for the local application
    pub(crate) fn deliver(&mut self, apdu: Apdu) {
        self.actions
            .push(SsmAction::Deliver(Pdu::from_peer(self.peer.clone(), apdu)));
    }

    /// The single path every transition goes through
    pub fn set_state(&mut self, new_state: SsmState, timer: Option<Duration>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ApplicationError::InvalidStateTransition {
                from: self.state,
                to: new_state,
            });
        }

        debug!(
            "ssm {} {}: {} -> {}",
            self.invoke_id, self.peer, self.state, new_state
        );
        self.stop_timer();
        self.state = new_state;

        if let Some(after) = timer {
            self.start_timer(after);
        }
        Ok(())
    }

    pub fn start_timer(&mut self, after: Duration) {
        self.timer_armed = true;
        self.actions.push(SsmAction::StartTimer(after));
    }

    /// Idempotent: nothing is emitted when no timer is pending
    pub fn stop_timer(&mut self) {
        if self.timer_armed {
            self.timer_armed = false;
            self.actions.push(SsmAction::StopTimer);
        }
    }

    pub fn restart_timer(&mut self, after: Duration) {
        self.stop_timer();
        self.start_timer(after);
    }

    /// The pending timer fired; it is no longer armed
    pub(crate) fn timer_fired(&mut self) {
        self.timer_armed = false;
    }

    pub fn set_segmentation_context(&mut self, apdu: &Apdu) -> Result<()> {
        self.segment_context = Some(SegmentationContext::new(apdu)?);
        Ok(())
    }

    pub fn append_segment(&mut self, chunk: &Apdu) -> Result<()> {
        self.segment_context
            .as_mut()
            .ok_or(ApplicationError::NoSegmentationContext)?
            .append(chunk)
    }

    /// Size segments and count them for the current context
    pub(crate) fn plan_segments(&mut self, segment_size: usize) -> Result<usize> {
        let len = self
            .segment_context
            .as_ref()
            .ok_or(ApplicationError::NoSegmentationContext)?
            .len();
        self.segment_size = segment_size.max(1);
        self.segment_count = len.div_ceil(self.segment_size).max(1);
        debug!(
            "ssm {}: {} octets in {} segment(s) of {}",
            self.invoke_id, len, self.segment_count, self.segment_size
        );
        Ok(self.segment_count)
    }

    /// Segment `index` of the context and whether more follow it
    pub fn get_segment(&self, index: usize) -> Result<(Apdu, bool)> {
        let context = self
            .segment_context
            .as_ref()
            .ok_or(ApplicationError::NoSegmentationContext)?;

        if index >= self.segment_count {
            return Err(ApplicationError::IndexOutOfRange {
                index,
                count: self.segment_count,
            });
        }

        if self.segment_count == 1 {
            return Ok((context.original.clone(), false));
        }

        let more_follows = index < self.segment_count - 1;
        let sequence_number = (index % 256) as u8;
        let window = if index == 0 {
            self.proposed_window_size
        } else {
            self.actual_window_size.unwrap_or(self.proposed_window_size)
        };

        let start = index * self.segment_size;
        let end = (start + self.segment_size).min(context.len());
        let service_data = Bytes::copy_from_slice(&context.service_bytes[start..end]);

        let segment = match &context.original {
            Apdu::ConfirmedRequest { service_choice, .. } => Apdu::ConfirmedRequest {
                segmented: true,
                more_follows,
                segmented_response_accepted: self.segmentation_supported.can_receive(),
                max_segments: self.max_segments_accepted,
                max_response_size: self.max_apdu_length_accepted,
                invoke_id: self.invoke_id,
                sequence_number: Some(sequence_number),
                proposed_window_size: Some(window),
                service_choice: *service_choice,
                service_data,
            },
            _ => Apdu::ComplexAck {
                segmented: true,
                more_follows,
                invoke_id: self.invoke_id,
                sequence_number: Some(sequence_number),
                proposed_window_size: Some(window),
                service_choice: context.service_choice,
                service_data,
            },
        };

        Ok((segment, more_follows))
    }

    /// Window test against the negotiated window size
    pub fn in_window(&self, seq_a: u8, seq_b: u8) -> bool {
        in_window(seq_a, seq_b, self.actual_window_size.unwrap_or(1))
    }

    /// Send up to one window of segments starting at sequence `start`
    pub fn fill_window(&mut self, start: u8) -> Result<()> {
        let window = self.actual_window_size.unwrap_or(1);
        for offset in 0..window as usize {
            let (segment, more_follows) = self.get_segment(start as usize + offset)?;
            self.send(segment);
            if !more_follows {
                self.sent_all_segments = true;
                break;
            }
        }
        Ok(())
    }

    /// Enter `Aborted` and build the Abort PDU for `reason`
    pub(crate) fn abort(&mut self, reason: AbortReason) -> Result<Apdu> {
        debug!("ssm {} {}: abort {}", self.invoke_id, self.peer, reason);
        self.set_state(SsmState::Aborted, None)?;
        Ok(Apdu::abort(self.server, self.invoke_id, reason))
    }

    /// Take in the next segment of an incoming segmented message
    ///
    /// Shared by the client's `SEGMENTED_CONFIRMATION` and the server's `SEGMENTED_REQUEST`.
    /// Returns true once the final segment has been appended and acknowledged.
    pub(crate) fn receive_segment(&mut self, segment: &Apdu) -> Result<bool> {
        let window = self.actual_window_size.unwrap_or(1);
        let expected = self.last_sequence_number.wrapping_add(1);

        if segment.sequence_number() != Some(expected) {
            debug!(
                "ssm {}: segment {:?} out of order, expected {}",
                self.invoke_id,
                segment.sequence_number(),
                expected
            );
            self.restart_timer(self.segment_timeout);
            let nak = Apdu::segment_ack(
                true,
                self.server,
                self.invoke_id,
                self.initial_sequence_number,
                window,
            );
            self.send(nak);
            return Ok(false);
        }

        self.append_segment(&segment.without_segmentation())?;
        self.last_sequence_number = expected;

        if !segment.more_follows() {
            let ack = Apdu::segment_ack(
                false,
                self.server,
                self.invoke_id,
                self.last_sequence_number,
                window,
            );
            self.send(ack);
            return Ok(true);
        }

        if self.last_sequence_number == self.initial_sequence_number.wrapping_add(window) {
            self.initial_sequence_number = self.last_sequence_number;
            self.restart_timer(self.segment_timeout);
            let ack = Apdu::segment_ack(
                false,
                self.server,
                self.invoke_id,
                self.last_sequence_number,
                window,
            );
            self.send(ack);
        } else {
            self.restart_timer(self.segment_timeout);
        }
        Ok(false)
    }

    /// Start receiving a segmented message whose first segment is `first`
    pub(crate) fn begin_reassembly(&mut self, first: &Apdu) -> Result<()> {
        self.set_segmentation_context(&first.without_segmentation())?;
        let proposed = first.window_size().unwrap_or(1).max(1);
        self.actual_window_size = Some(proposed.min(self.proposed_window_size));
        self.last_sequence_number = 0;
        self.initial_sequence_number = 0;
        Ok(())
    }

    /// Sender side handling of a Segment-ACK; returns true when every segment is acknowledged
    pub(crate) fn segment_ack_received(&mut self, ack: &Apdu) -> Result<bool> {
        let (sequence_number, window_size) = match ack {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => (*sequence_number, *window_size),
            other => {
                return Err(ApplicationError::InvalidApdu(format!(
                    "expected SegmentAck, got {:?}",
                    other.apdu_type()
                )))
            }
        };

        self.actual_window_size = Some(window_size.max(1));

        if !self.in_window(sequence_number, self.initial_sequence_number) {
            debug!(
                "ssm {}: stale segment ack {} (window starts at {})",
                self.invoke_id, sequence_number, self.initial_sequence_number
            );
            self.restart_timer(self.segment_timeout);
            return Ok(false);
        }

        if self.sent_all_segments {
            return Ok(true);
        }

        self.initial_sequence_number = sequence_number.wrapping_add(1);
        self.segment_retry_count = 0;
        self.fill_window(self.initial_sequence_number)?;
        self.restart_timer(self.segment_timeout);
        Ok(false)
    }

    /// Sender side segment timeout; false once the retry budget is spent
    pub(crate) fn resend_window(&mut self) -> Result<bool> {
        if self.segment_retry_count >= self.number_of_apdu_retries {
            return Ok(false);
        }
        self.segment_retry_count += 1;
        debug!(
            "ssm {}: segment retry {}/{}",
            self.invoke_id, self.segment_retry_count, self.number_of_apdu_retries
        );

        if self.initial_sequence_number == 0 {
            let (first, _) = self.get_segment(0)?;
            self.send(first);
        } else {
            self.fill_window(self.initial_sequence_number)?;
        }
        self.start_timer(self.segment_timeout);
        Ok(true)
    }
}
