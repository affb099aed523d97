//! MQTT v5.0 Reason Codes
//!
//! Only the codes an acknowledgment packet (PUBACK, PUBREC, PUBREL, PUBCOMP)
//! may carry.

use std::fmt;

/// MQTT v5.0 Reason Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReasonCode {
    /// Success
    #[default]
    Success = 0x00,
    /// No matching subscribers
    NoMatchingSubscribers = 0x10,
    /// Unspecified error
    UnspecifiedError = 0x80,
    /// Implementation specific error
    ImplementationError = 0x83,
    /// Not authorized
    NotAuthorized = 0x87,
    /// Topic Name invalid
    TopicNameInvalid = 0x90,
    /// Packet Identifier in use
    PacketIdentifierInUse = 0x91,
    /// Packet Identifier not found
    PacketIdentifierNotFound = 0x92,
    /// Quota exceeded
    QuotaExceeded = 0x97,
    /// Payload format invalid
    PayloadFormatInvalid = 0x99,
}

impl ReasonCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ReasonCode::Success),
            0x10 => Some(ReasonCode::NoMatchingSubscribers),
            0x80 => Some(ReasonCode::UnspecifiedError),
            0x83 => Some(ReasonCode::ImplementationError),
            0x87 => Some(ReasonCode::NotAuthorized),
            0x90 => Some(ReasonCode::TopicNameInvalid),
            0x91 => Some(ReasonCode::PacketIdentifierInUse),
            0x92 => Some(ReasonCode::PacketIdentifierNotFound),
            0x97 => Some(ReasonCode::QuotaExceeded),
            0x99 => Some(ReasonCode::PayloadFormatInvalid),
            _ => None,
        }
    }

    /// Returns true for codes below 0x80
    pub fn is_success(self) -> bool {
        (self as u8) < 0x80
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, *self as u8)
    }
}
