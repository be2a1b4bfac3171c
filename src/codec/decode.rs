use std::num::NonZeroU16;

use ntex_bytes::{Buf, Bytes, ByteString};

use super::packet::{Connect, LastWill, Packet, Publish, SubscribeReturnCode};
use crate::error::DecodeError;
use crate::types::{packet_type, ConnectAckFlags, ConnectFlags, ProtocolLevel, QoS};
use crate::types::WILL_QOS_SHIFT;

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    match first_byte {
        packet_type::CONNECT => decode_connect_packet(&mut src),
        packet_type::CONNACK => decode_connect_ack_packet(&mut src),
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            decode_publish_packet(&mut src, first_byte & 0b0000_1111)
        }
        packet_type::PUBACK => decode_ack(src, |packet_id| Packet::PublishAck { packet_id }),
        packet_type::PUBREC => {
            decode_ack(src, |packet_id| Packet::PublishReceived { packet_id })
        }
        packet_type::PUBREL => {
            decode_ack(src, |packet_id| Packet::PublishRelease { packet_id })
        }
        packet_type::PUBCOMP => {
            decode_ack(src, |packet_id| Packet::PublishComplete { packet_id })
        }
        packet_type::SUBSCRIBE => decode_subscribe_packet(&mut src),
        packet_type::SUBACK => decode_subscribe_ack_packet(&mut src),
        packet_type::UNSUBSCRIBE => decode_unsubscribe_packet(&mut src),
        packet_type::UNSUBACK => {
            decode_ack(src, |packet_id| Packet::UnsubscribeAck { packet_id })
        }
        packet_type::PINGREQ => Ok(Packet::PingRequest),
        packet_type::PINGRESP => Ok(Packet::PingResponse),
        packet_type::DISCONNECT => Ok(Packet::Disconnect),
        _ => Err(DecodeError::UnsupportedPacketType),
    }
}

pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

/// Decodes variable length and returns tuple of (length, bytes consumed)
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut len: u32 = 0;
    for (idx, val) in src.iter().copied().take(4).enumerate() {
        len += u32::from(val & 0x7F) << (idx * 7);
        if val & 0x80 == 0 {
            return Ok(Some((len, idx + 1)));
        }
    }
    // no stop byte within the first four bytes
    ensure!(src.len() < 4, DecodeError::InvalidLength);
    Ok(None)
}

#[inline]
fn decode_ack(
    mut src: Bytes,
    f: impl Fn(NonZeroU16) -> Packet,
) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(&mut src)?;
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(f(packet_id))
}

fn decode_connect_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 10, DecodeError::InvalidLength);
    let name = Bytes::decode(src)?;

    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    let level = src.get_u8();
    let protocol_level = match (name.as_ref(), level) {
        (b"MQTT", 4) => ProtocolLevel::V3_1_1,
        (b"MQIsdp", 3) => ProtocolLevel::V3_1,
        (b"MQTT", _) | (b"MQIsdp", _) => return Err(DecodeError::UnsupportedProtocolLevel),
        _ => return Err(DecodeError::InvalidProtocol),
    };

    let flags =
        ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;

    let keep_alive = u16::decode(src)?;
    let client_id = ByteString::decode(src)?;

    ensure!(
        !client_id.is_empty() || flags.contains(ConnectFlags::CLEAN_START),
        DecodeError::InvalidClientId
    );

    let last_will = if flags.contains(ConnectFlags::WILL) {
        let topic = ByteString::decode(src)?;
        let message = Bytes::decode(src)?;
        Some(LastWill {
            qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            topic,
            message,
        })
    } else {
        None
    };
    let username = if flags.contains(ConnectFlags::USERNAME) {
        Some(ByteString::decode(src)?)
    } else {
        None
    };
    let password = if flags.contains(ConnectFlags::PASSWORD) {
        Some(Bytes::decode(src)?)
    } else {
        None
    };
    Ok(Packet::Connect(Box::new(Connect {
        protocol_level,
        clean_session: flags.contains(ConnectFlags::CLEAN_START),
        keep_alive,
        client_id,
        last_will,
        username,
        password,
    })))
}

fn decode_connect_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let flags = ConnectAckFlags::from_bits(src.get_u8())
        .ok_or(DecodeError::ConnAckReservedFlagSet)?;

    let return_code = src.get_u8().into();
    Ok(Packet::ConnectAck {
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
        return_code,
    })
}

fn decode_publish_packet(src: &mut Bytes, packet_flags: u8) -> Result<Packet, DecodeError> {
    let topic = ByteString::decode(src)?;
    let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        // packet id = 0 is a protocol violation
        Some(NonZeroU16::decode(src)?)
    };

    Ok(Packet::Publish(Publish {
        dup: (packet_flags & 0b1000) == 0b1000,
        qos,
        retain: (packet_flags & 0b0001) == 0b0001,
        topic,
        packet_id,
        payload: src.split_off(0),
    }))
}

fn decode_subscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        let topic = ByteString::decode(src)?;
        ensure!(src.remaining() >= 1, DecodeError::InvalidLength);
        let qos = QoS::try_from(src.get_u8() & 0b0000_0011)?;
        topic_filters.push((topic, qos));
    }

    Ok(Packet::Subscribe { packet_id, topic_filters })
}

fn decode_subscribe_ack_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut status = Vec::with_capacity(src.len());
    for code in src.as_ref().iter() {
        status.push(if *code == 0x80 {
            SubscribeReturnCode::Failure
        } else {
            SubscribeReturnCode::Success(QoS::try_from(*code)?)
        });
    }
    Ok(Packet::SubscribeAck { packet_id, status })
}

fn decode_unsubscribe_packet(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        topic_filters.push(ByteString::decode(src)?);
    }
    Ok(Packet::Unsubscribe { packet_id, topic_filters })
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        Ok(src.get_u16())
    }
}

impl Decode for NonZeroU16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        NonZeroU16::new(u16::decode(src)?).ok_or(DecodeError::MalformedPacket)
    }
}

impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u16::decode(src)? as usize;
        ensure!(src.remaining() >= len, DecodeError::InvalidLength);
        Ok(src.split_to(len))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let bytes = Bytes::decode(src)?;
        std::str::from_utf8(&bytes)?;
        ByteString::try_from(bytes).map_err(|_| DecodeError::MalformedPacket)
    }
}

#[cfg(test)]
mod tests {
    use super::super::packet::ConnectAckReason;
    use super::*;

    macro_rules! assert_decode_packet (
        ($bytes:expr, $res:expr) => {{
            let first_byte = $bytes.as_ref()[0];
            let (_len, consumed) = decode_variable_length(&$bytes[1..]).unwrap().unwrap();
            let cur = Bytes::from_static(&$bytes[consumed + 1..]);
            assert_eq!(decode_packet(cur, first_byte), Ok($res));
        }};
    );

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    #[test]
    fn test_decode_variable_length() {
        assert_eq!(decode_variable_length(b"\x00"), Ok(Some((0, 1))));
        assert_eq!(decode_variable_length(b"\x7f"), Ok(Some((127, 1))));
        assert_eq!(decode_variable_length(b"\x7f\x7f"), Ok(Some((127, 1))));
        assert_eq!(decode_variable_length(b"\x80\x01"), Ok(Some((128, 2))));
        assert_eq!(decode_variable_length(b"\xff\x7f"), Ok(Some((16383, 2))));
        assert_eq!(decode_variable_length(b"\x80\x80\x01"), Ok(Some((16384, 3))));
        assert_eq!(decode_variable_length(b"\xff\xff\x7f"), Ok(Some((2097151, 3))));
        assert_eq!(decode_variable_length(b"\x80\x80\x80\x01"), Ok(Some((2097152, 4))));
        assert_eq!(decode_variable_length(b"\xff\xff\xff\x7f"), Ok(Some((268435455, 4))));

        assert_eq!(decode_variable_length(b"\x80"), Ok(None));
        assert_eq!(decode_variable_length(b"\xff\xff\xff"), Ok(None));
        assert_eq!(
            decode_variable_length(b"\xff\xff\xff\xff\xff\xff"),
            Err(DecodeError::InvalidLength)
        );
    }

    #[test]
    fn test_decode_connect_packets() {
        let mut src = Bytes::from_static(
            b"\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass",
        );
        assert_eq!(
            decode_connect_packet(&mut src),
            Ok(Packet::Connect(Box::new(Connect {
                protocol_level: ProtocolLevel::V3_1_1,
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: None,
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
            })))
        );

        let mut src = Bytes::from_static(
            b"\x00\x06MQIsdp\x03\x02\x00\x3C\x00\x08shelly25",
        );
        assert_eq!(
            decode_connect_packet(&mut src),
            Ok(Packet::Connect(Box::new(Connect {
                protocol_level: ProtocolLevel::V3_1,
                clean_session: true,
                keep_alive: 60,
                client_id: ByteString::from_static("shelly25"),
                last_will: None,
                username: None,
                password: None,
            })))
        );

        let mut src = Bytes::from_static(
            b"\x00\x04MQTT\x04\x14\x00\x3C\x00\x0512345\x00\x05topic\x00\x07message",
        );
        assert_eq!(
            decode_connect_packet(&mut src),
            Ok(Packet::Connect(Box::new(Connect {
                protocol_level: ProtocolLevel::V3_1_1,
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: Some(LastWill {
                    qos: QoS::ExactlyOnce,
                    retain: false,
                    topic: ByteString::from_static("topic"),
                    message: Bytes::from_static(b"message"),
                }),
                username: None,
                password: None,
            })))
        );

        let mut src = Bytes::from_static(b"\x00\x02MQ00000000000000000000");
        assert_eq!(decode_connect_packet(&mut src), Err(DecodeError::InvalidProtocol));
        let mut src = Bytes::from_static(b"\x00\x04MQAA00000000000000000000");
        assert_eq!(decode_connect_packet(&mut src), Err(DecodeError::InvalidProtocol));
        let mut src = Bytes::from_static(b"\x00\x04MQTT\x0300000000000000000000");
        assert_eq!(
            decode_connect_packet(&mut src),
            Err(DecodeError::UnsupportedProtocolLevel)
        );
        let mut src = Bytes::from_static(b"\x00\x06MQIsdp\x0400000000000000000000");
        assert_eq!(
            decode_connect_packet(&mut src),
            Err(DecodeError::UnsupportedProtocolLevel)
        );
        let mut src = Bytes::from_static(b"\x00\x04MQTT\x04\xff00000000000000000000");
        assert_eq!(
            decode_connect_packet(&mut src),
            Err(DecodeError::ConnectReservedFlagSet)
        );
    }

    #[test]
    fn test_decode_connect_ack_packet() {
        let mut src = Bytes::from_static(b"\x01\x04");
        assert_eq!(
            decode_connect_ack_packet(&mut src),
            Ok(Packet::ConnectAck {
                session_present: true,
                return_code: ConnectAckReason::BadUserNameOrPassword,
            })
        );

        assert_decode_packet!(
            b"\x20\x02\x01\x04",
            Packet::ConnectAck {
                session_present: true,
                return_code: ConnectAckReason::BadUserNameOrPassword,
            }
        );
    }

    #[test]
    fn test_decode_publish_packets() {
        assert_decode_packet!(
            b"\x3d\x0D\x00\x05topic\x43\x21data",
            Packet::Publish(Publish {
                dup: true,
                retain: true,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("topic"),
                packet_id: Some(packet_id(0x4321)),
                payload: Bytes::from_static(b"data"),
            })
        );
        assert_decode_packet!(
            b"\x30\x0b\x00\x05topicdata",
            Packet::Publish(Publish {
                dup: false,
                retain: false,
                qos: QoS::AtMostOnce,
                topic: ByteString::from_static("topic"),
                packet_id: None,
                payload: Bytes::from_static(b"data"),
            })
        );

        assert_decode_packet!(b"\x40\x02\x43\x21", Packet::PublishAck { packet_id: packet_id(0x4321) });
        assert_decode_packet!(b"\x50\x02\x43\x21", Packet::PublishReceived { packet_id: packet_id(0x4321) });
        assert_decode_packet!(b"\x62\x02\x43\x21", Packet::PublishRelease { packet_id: packet_id(0x4321) });
        assert_decode_packet!(b"\x70\x02\x43\x21", Packet::PublishComplete { packet_id: packet_id(0x4321) });
    }

    #[test]
    fn test_decode_subscribe_packets() {
        let p = Packet::Subscribe {
            packet_id: packet_id(0x1234),
            topic_filters: vec![
                (ByteString::from_static("test"), QoS::AtLeastOnce),
                (ByteString::from_static("filter"), QoS::ExactlyOnce),
            ],
        };
        assert_decode_packet!(b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02", p);

        let p = Packet::SubscribeAck {
            packet_id: packet_id(0x1234),
            status: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
                SubscribeReturnCode::Success(QoS::ExactlyOnce),
            ],
        };
        assert_decode_packet!(b"\x90\x05\x12\x34\x01\x80\x02", p);

        let p = Packet::Unsubscribe {
            packet_id: packet_id(0x1234),
            topic_filters: vec![
                ByteString::from_static("test"),
                ByteString::from_static("filter"),
            ],
        };
        assert_decode_packet!(b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter", p);

        assert_decode_packet!(b"\xb0\x02\x43\x21", Packet::UnsubscribeAck { packet_id: packet_id(0x4321) });
    }

    #[test]
    fn test_decode_ping_packets() {
        assert_decode_packet!(b"\xc0\x00", Packet::PingRequest);
        assert_decode_packet!(b"\xd0\x00", Packet::PingResponse);
        assert_decode_packet!(b"\xe0\x00", Packet::Disconnect);
    }

    #[test]
    fn test_decode_zero_packet_id_is_malformed() {
        let mut src = Bytes::from_static(b"\x00\x00");
        assert_eq!(NonZeroU16::decode(&mut src), Err(DecodeError::MalformedPacket));
    }

    #[test]
    fn test_decode_invalid_utf8_string() {
        let mut src = Bytes::from_static(b"\x00\x02\xff\xfe");
        assert!(matches!(
            ByteString::decode(&mut src),
            Err(DecodeError::Utf8Error(_))
        ));

        // publish topic must be valid utf8
        let src = Bytes::from_static(b"\x00\x02\xff\xfedata");
        assert!(matches!(
            decode_packet(src, 0b0011_0000),
            Err(DecodeError::Utf8Error(_))
        ));
    }
}
