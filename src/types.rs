use crate::error::DecodeError;

/// Quality of Service levels
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum QoS {
    /// At most once delivery
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl From<QoS> for u8 {
    fn from(v: QoS) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(DecodeError::InvalidQoS(v)),
        }
    }
}

/// MQTT protocol level carried in the Connect packet.
///
/// Level 3 is MQTT v3.1 (protocol name `MQIsdp`), level 4 is v3.1.1
/// (protocol name `MQTT`). Both are accepted; everything else is refused
/// at decode time.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum ProtocolLevel {
    V3_1 = 3,
    #[default]
    V3_1_1 = 4,
}

impl ProtocolLevel {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub(crate) fn name(self) -> &'static [u8] {
        match self {
            ProtocolLevel::V3_1 => b"MQIsdp",
            ProtocolLevel::V3_1_1 => b"MQTT",
        }
    }
}

pub(crate) mod packet_type {
    pub(crate) const CONNECT: u8 = 0b0001_0000;
    pub(crate) const CONNACK: u8 = 0b0010_0000;
    pub(crate) const PUBLISH_START: u8 = 0b0011_0000;
    pub(crate) const PUBLISH_END: u8 = 0b0011_1111;
    pub(crate) const PUBACK: u8 = 0b0100_0000;
    pub(crate) const PUBREC: u8 = 0b0101_0000;
    pub(crate) const PUBREL: u8 = 0b0110_0010;
    pub(crate) const PUBCOMP: u8 = 0b0111_0000;
    pub(crate) const SUBSCRIBE: u8 = 0b1000_0010;
    pub(crate) const SUBACK: u8 = 0b1001_0000;
    pub(crate) const UNSUBSCRIBE: u8 = 0b1010_0010;
    pub(crate) const UNSUBACK: u8 = 0b1011_0000;
    pub(crate) const PINGREQ: u8 = 0b1100_0000;
    pub(crate) const PINGRESP: u8 = 0b1101_0000;
    pub(crate) const DISCONNECT: u8 = 0b1110_0000;
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct ConnectFlags: u8 {
        const USERNAME    = 0b1000_0000;
        const PASSWORD    = 0b0100_0000;
        const WILL_RETAIN = 0b0010_0000;
        const WILL_QOS    = 0b0001_1000;
        const WILL        = 0b0000_0100;
        const CLEAN_START = 0b0000_0010;
    }
}

pub(crate) const WILL_QOS_SHIFT: u8 = 3;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub(crate) struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 0b0000_0001;
    }
}

/// Fixed header of an MQTT control packet
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) struct FixedHeader {
    /// Packet type and flags
    pub(crate) first_byte: u8,
    /// The number of bytes remaining within the current packet,
    /// including data in the variable header and the payload.
    pub(crate) remaining_length: u32,
}
