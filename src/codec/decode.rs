//! MQTT Packet Decoder
//!
//! Decodes delivery packets for both v3.1.1 and v5.0

use std::sync::Arc;

use bytes::Bytes;

use super::{read_string, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    DecodeError, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    ReasonCode,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum packet size
    max_packet_size: usize,
    /// Negotiated protocol version
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Decode a packet from the buffer
    /// Returns (packet, bytes_consumed), `None` when the buffer holds only part
    /// of a packet, or an error
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        // Parse fixed header
        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        // Read remaining length
        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;

        // Check packet size limit
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        // Wait for complete packet
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            3 => self.decode_publish(flags, payload)?,
            4 => {
                let (packet_id, reason_code) = self.decode_ack(flags, 0x00, payload)?;
                Packet::PubAck(PubAck {
                    packet_id,
                    reason_code,
                })
            }
            5 => {
                let (packet_id, reason_code) = self.decode_ack(flags, 0x00, payload)?;
                Packet::PubRec(PubRec {
                    packet_id,
                    reason_code,
                })
            }
            6 => {
                // PUBREL must have flags 0010
                let (packet_id, reason_code) = self.decode_ack(flags, 0x02, payload)?;
                Packet::PubRel(PubRel {
                    packet_id,
                    reason_code,
                })
            }
            7 => {
                let (packet_id, reason_code) = self.decode_ack(flags, 0x00, payload)?;
                Packet::PubComp(PubComp {
                    packet_id,
                    reason_code,
                })
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        // DUP must be 0 for QoS 0
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut pos = 0;

        // Topic name
        let (topic, len) = read_string(&payload[pos..])?;
        pos += len;

        // Validate topic (no wildcards allowed in PUBLISH)
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        // Packet ID (only for QoS > 0)
        let packet_id = if qos != QoS::AtMostOnce {
            if pos + 2 > payload.len() {
                return Err(DecodeError::InsufficientData);
            }
            let id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        // Properties (v5.0 only) are skipped
        if self.protocol_version == ProtocolVersion::V5 {
            let (props_len, len) = read_variable_int(&payload[pos..])?;
            pos += len + props_len as usize;
            if pos > payload.len() {
                return Err(DecodeError::MalformedPacket("property length exceeds packet"));
            }
        }

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    fn decode_ack(
        &self,
        flags: u8,
        expected_flags: u8,
        payload: &[u8],
    ) -> Result<(u16, ReasonCode), DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }

        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let packet_id = u16::from_be_bytes([payload[0], payload[1]]);
        if packet_id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }

        let reason_code = match self.protocol_version {
            ProtocolVersion::V5 if payload.len() > 2 => ReasonCode::from_u8(payload[2])
                .ok_or(DecodeError::InvalidReasonCode(payload[2]))?,
            ProtocolVersion::V311 if payload.len() != 2 => {
                return Err(DecodeError::MalformedPacket(
                    "acknowledgment must have remaining length 2",
                ))
            }
            _ => ReasonCode::Success,
        };

        Ok((packet_id, reason_code))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
