//! MQTT Packet Encoder
//!
//! Encodes delivery packets for both v3.1.1 and v5.0

use bytes::{BufMut, BytesMut};

use super::{write_string, write_variable_int};
use crate::protocol::{EncodeError, Packet, ProtocolVersion, Publish, QoS, ReasonCode};

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p.packet_id, p.reason_code, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p.packet_id, p.reason_code, buf),
            // PUBREL fixed header flags are 0010
            Packet::PubRel(p) => self.encode_ack(0x62, p.packet_id, p.reason_code, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p.packet_id, p.reason_code, buf),
        }
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let is_v5 = self.protocol_version == ProtocolVersion::V5;

        if (packet.qos == QoS::AtMostOnce) != packet.packet_id.is_none() {
            return Err(EncodeError::PacketIdMismatch);
        }

        // Calculate remaining length
        let mut remaining_length = 2 + packet.topic.len(); // topic length prefix + topic

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2; // packet identifier
        }

        if is_v5 {
            remaining_length += 1; // empty property block
        }

        remaining_length += packet.payload.len();

        // Fixed header
        let mut first_byte: u8 = 0x30; // PUBLISH type (0011)
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        // Topic name
        write_string(buf, &packet.topic)?;

        // Packet identifier (only for QoS > 0)
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        if is_v5 {
            buf.put_u8(0x00);
        }

        // Payload
        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout: identifier, then
    /// (v5.0 only, omitted on success) the reason code.
    fn encode_ack(
        &self,
        first_byte: u8,
        packet_id: u16,
        reason_code: ReasonCode,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let with_reason =
            self.protocol_version == ProtocolVersion::V5 && reason_code != ReasonCode::Success;

        buf.put_u8(first_byte);
        write_variable_int(buf, if with_reason { 3 } else { 2 })?;
        buf.put_u16(packet_id);
        if with_reason {
            buf.put_u8(reason_code as u8);
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
