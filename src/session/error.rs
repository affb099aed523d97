//! Delivery error types.

use std::fmt;

use super::packet_id::Direction;
use crate::protocol::PacketType;

/// Errors raised by the delivery state machine.
///
/// None of these are fatal to the process: each is scoped to one connection
/// or one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Every identifier in 1..=65535 is active for this connection+direction
    ExhaustedIdentifierSpace { direction: Direction },
    /// The peer never acknowledged within the retry budget
    DeliveryAbandoned {
        packet_id: u16,
        direction: Direction,
        retries: u32,
    },
    /// A control packet referenced an unknown or already terminal exchange
    UnknownExchangeReference {
        packet_id: u16,
        packet: PacketType,
    },
    /// A peer-chosen identifier is already occupied by a live exchange
    IdentifierInUse { packet_id: u16 },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExhaustedIdentifierSpace { direction } => {
                write!(f, "{} packet identifier space exhausted", direction)
            }
            Self::DeliveryAbandoned {
                packet_id,
                direction,
                retries,
            } => write!(
                f,
                "{} delivery of packet {} abandoned after {} retries",
                direction, packet_id, retries
            ),
            Self::UnknownExchangeReference { packet_id, packet } => {
                write!(f, "{} references unknown packet {}", packet, packet_id)
            }
            Self::IdentifierInUse { packet_id } => {
                write!(f, "packet identifier {} already in use", packet_id)
            }
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;
