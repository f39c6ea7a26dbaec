//! BACnet Service Identifiers
//!
//! This module holds the service-level enumerations the application layer needs to route
//! and gate APDUs without decoding service parameters:
//!
//! - Confirmed and unconfirmed service choices
//! - Abort and reject reasons
//! - Device communication control modes
//!
//! Abort and reject reasons follow ASHRAE 135 Clause 21: values 0..=63 are reserved for
//! the standard, 64..=255 are available for proprietary use. Two proprietary abort
//! reasons are assigned locally, `ServerTimeout` (64) and `NoResponse` (65).
//!
//! # Example
//!
//! ```
//! use bacnet_appservice::service::{AbortReason, ConfirmedServiceChoice};
//!
//! let choice = ConfirmedServiceChoice::try_from(12u8).unwrap();
//! assert_eq!(choice, ConfirmedServiceChoice::ReadProperty);
//!
//! assert_eq!(AbortReason::from(65u8), AbortReason::NoResponse);
//! assert_eq!(u8::from(AbortReason::SegmentationNotSupported), 4);
//! ```

use thiserror::Error;

use crate::generate_custom_enum;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur when interpreting service identifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Service choice is not known
    #[error("Unsupported service choice: {0}")]
    UnsupportedServiceChoice(u8),
    /// Enumerated value outside the defined range
    #[error("Invalid enumeration value: {0}")]
    InvalidEnumeration(u8),
}

/// Confirmed service choices (ASHRAE 135 Clause 21, BACnetConfirmedServiceChoice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    GetEventInformation = 29,
    SubscribeCovProperty = 28,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    ReadRange = 26,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,

    // Virtual Terminal Services
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,

    // Security Services
    Authenticate = 24,
    RequestKey = 25,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCovNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCov),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            21 => Ok(Self::VtOpen),
            22 => Ok(Self::VtClose),
            23 => Ok(Self::VtData),
            24 => Ok(Self::Authenticate),
            25 => Ok(Self::RequestKey),
            26 => Ok(Self::ReadRange),
            28 => Ok(Self::SubscribeCovProperty),
            29 => Ok(Self::GetEventInformation),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

impl ConfirmedServiceChoice {
    /// Services a device must keep processing while communication is disabled
    pub fn allowed_when_disabled(&self) -> bool {
        matches!(
            self,
            ConfirmedServiceChoice::DeviceCommunicationControl
                | ConfirmedServiceChoice::ReinitializeDevice
        )
    }
}

/// Unconfirmed service choices (BACnetUnconfirmedServiceChoice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
    UnconfirmedCovNotificationMultiple = 11,
    UnconfirmedAuditNotification = 12,
    WhoAmI = 13,
    YouAre = 14,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            11 => Ok(Self::UnconfirmedCovNotificationMultiple),
            12 => Ok(Self::UnconfirmedAuditNotification),
            13 => Ok(Self::WhoAmI),
            14 => Ok(Self::YouAre),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

generate_custom_enum! {
    /// Abort reason codes (BACnetAbortReason)
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
        ServerTimeout = 64,
        NoResponse = 65,
    },
    u8,
    64..=255
}

generate_custom_enum! {
    /// Reject reason codes (BACnetRejectReason)
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

/// Device communication control mode (DeviceCommunicationControl-Request `enable-disable`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum EnableDisable {
    /// All communication permitted
    #[default]
    Enable = 0,
    /// Only DCC, ReinitializeDevice and Who-Is are processed
    Disable = 1,
    /// Responses allowed, no new requests initiated except I-Am
    DisableInitiation = 2,
}

impl TryFrom<u8> for EnableDisable {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Enable),
            1 => Ok(Self::Disable),
            2 => Ok(Self::DisableInitiation),
            _ => Err(ServiceError::InvalidEnumeration(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_service_choice_conversion() {
        assert_eq!(
            ConfirmedServiceChoice::try_from(17).unwrap(),
            ConfirmedServiceChoice::DeviceCommunicationControl
        );
        assert_eq!(ConfirmedServiceChoice::ReadPropertyMultiple as u8, 14);
        assert_eq!(
            ConfirmedServiceChoice::try_from(13),
            Err(ServiceError::UnsupportedServiceChoice(13))
        );
    }

    #[test]
    fn test_allowed_when_disabled() {
        assert!(ConfirmedServiceChoice::DeviceCommunicationControl.allowed_when_disabled());
        assert!(ConfirmedServiceChoice::ReinitializeDevice.allowed_when_disabled());
        assert!(!ConfirmedServiceChoice::ReadProperty.allowed_when_disabled());
    }

    #[test]
    fn test_abort_reason_ranges() {
        assert_eq!(AbortReason::from(2u8), AbortReason::InvalidApduInThisState);
        assert_eq!(AbortReason::from(64u8), AbortReason::ServerTimeout);
        assert_eq!(u8::from(AbortReason::ApduTooLong), 11);

        match AbortReason::from(200u8) {
            AbortReason::Custom(value) => assert_eq!(value.value(), 200),
            other => panic!("Expected Custom, got {}", other),
        }
        match AbortReason::from(40u8) {
            AbortReason::Reserved(value) => assert_eq!(value.value(), 40),
            other => panic!("Expected Reserved, got {}", other),
        }
        assert_eq!(format!("{}", AbortReason::NoResponse), "NoResponse");
    }

    #[test]
    fn test_enable_disable() {
        assert_eq!(EnableDisable::default(), EnableDisable::Enable);
        assert_eq!(
            EnableDisable::try_from(2).unwrap(),
            EnableDisable::DisableInitiation
        );
        assert!(EnableDisable::try_from(3).is_err());
    }
}
