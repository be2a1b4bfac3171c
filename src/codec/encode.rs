use ntex_bytes::{BufMut, ByteString, BytesMut};

use super::packet::{Connect, LastWill, Packet, Publish, SubscribeReturnCode};
use crate::error::EncodeError;
use crate::types::{packet_type, ConnectAckFlags, ConnectFlags, QoS, WILL_QOS_SHIFT};

/// Content size of a packet, excluding the fixed header
pub(crate) fn get_encoded_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(connect) => {
            let Connect { protocol_level, last_will, client_id, username, password, .. } =
                connect.as_ref();

            // protocol name + level + flags + keep alive
            let mut n = 2 + protocol_level.name().len() + 1 + 1 + 2;
            n += 2 + client_id.len();

            if let Some(LastWill { topic, message, .. }) = last_will {
                n += 2 + topic.len() + 2 + message.len();
            }
            if let Some(s) = username {
                n += 2 + s.len();
            }
            if let Some(s) = password {
                n += 2 + s.len();
            }
            n
        }

        Packet::ConnectAck { .. } => 2, // flags + return code

        Packet::Publish(Publish { topic, packet_id, payload, .. }) => {
            2 + topic.len() + packet_id.map_or(0, |_| 2) + payload.len()
        }

        Packet::PublishAck { .. }
        | Packet::PublishReceived { .. }
        | Packet::PublishRelease { .. }
        | Packet::PublishComplete { .. }
        | Packet::UnsubscribeAck { .. } => 2, // packet id

        Packet::Subscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|(filter, _)| 2 + filter.len() + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|filter| 2 + filter.len()).sum::<usize>()
        }

        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

pub(crate) fn encode(
    packet: &Packet,
    dst: &mut BytesMut,
    content_size: u32,
) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(connect) => {
            write_fixed_header(packet_type::CONNECT, content_size, dst);

            write_slice(connect.protocol_level.name(), dst);
            dst.put_u8(connect.protocol_level.level());

            let mut flags = ConnectFlags::empty();
            if connect.clean_session {
                flags |= ConnectFlags::CLEAN_START;
            }
            if let Some(will) = &connect.last_will {
                flags |= ConnectFlags::WILL;
                flags |= ConnectFlags::from_bits_truncate(u8::from(will.qos) << WILL_QOS_SHIFT);
                if will.retain {
                    flags |= ConnectFlags::WILL_RETAIN;
                }
            }
            if connect.username.is_some() {
                flags |= ConnectFlags::USERNAME;
            }
            if connect.password.is_some() {
                flags |= ConnectFlags::PASSWORD;
            }
            dst.put_u8(flags.bits());
            dst.put_u16(connect.keep_alive);

            write_str(&connect.client_id, dst);
            if let Some(will) = &connect.last_will {
                write_str(&will.topic, dst);
                write_slice(&will.message, dst);
            }
            if let Some(s) = &connect.username {
                write_str(s, dst);
            }
            if let Some(s) = &connect.password {
                write_slice(s, dst);
            }
            Ok(())
        }

        Packet::ConnectAck { session_present, return_code } => {
            write_fixed_header(packet_type::CONNACK, content_size, dst);
            dst.put_u8(if *session_present {
                ConnectAckFlags::SESSION_PRESENT.bits()
            } else {
                0
            });
            dst.put_u8(return_code.reason_code());
            Ok(())
        }

        Packet::Publish(publish) => {
            if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
                return Err(EncodeError::PacketIdRequired);
            }
            let first_byte = packet_type::PUBLISH_START
                | (u8::from(publish.dup) << 3)
                | (u8::from(publish.qos) << 1)
                | u8::from(publish.retain);
            write_fixed_header(first_byte, content_size, dst);
            write_str(&publish.topic, dst);
            if let Some(packet_id) = publish.packet_id {
                dst.put_u16(packet_id.get());
            }
            dst.put_slice(&publish.payload);
            Ok(())
        }

        Packet::PublishAck { packet_id } => {
            write_packet_id(packet_type::PUBACK, *packet_id, content_size, dst);
            Ok(())
        }
        Packet::PublishReceived { packet_id } => {
            write_packet_id(packet_type::PUBREC, *packet_id, content_size, dst);
            Ok(())
        }
        Packet::PublishRelease { packet_id } => {
            write_packet_id(packet_type::PUBREL, *packet_id, content_size, dst);
            Ok(())
        }
        Packet::PublishComplete { packet_id } => {
            write_packet_id(packet_type::PUBCOMP, *packet_id, content_size, dst);
            Ok(())
        }

        Packet::Subscribe { packet_id, topic_filters } => {
            write_fixed_header(packet_type::SUBSCRIBE, content_size, dst);
            dst.put_u16(packet_id.get());
            for (filter, qos) in topic_filters {
                write_str(filter, dst);
                dst.put_u8(u8::from(*qos));
            }
            Ok(())
        }
        Packet::SubscribeAck { packet_id, status } => {
            write_fixed_header(packet_type::SUBACK, content_size, dst);
            dst.put_u16(packet_id.get());
            for code in status {
                dst.put_u8(match code {
                    SubscribeReturnCode::Success(qos) => u8::from(*qos),
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
            Ok(())
        }

        Packet::Unsubscribe { packet_id, topic_filters } => {
            write_fixed_header(packet_type::UNSUBSCRIBE, content_size, dst);
            dst.put_u16(packet_id.get());
            for filter in topic_filters {
                write_str(filter, dst);
            }
            Ok(())
        }
        Packet::UnsubscribeAck { packet_id } => {
            write_packet_id(packet_type::UNSUBACK, *packet_id, content_size, dst);
            Ok(())
        }

        Packet::PingRequest => {
            write_fixed_header(packet_type::PINGREQ, 0, dst);
            Ok(())
        }
        Packet::PingResponse => {
            write_fixed_header(packet_type::PINGRESP, 0, dst);
            Ok(())
        }
        Packet::Disconnect => {
            write_fixed_header(packet_type::DISCONNECT, 0, dst);
            Ok(())
        }
    }
}

#[inline]
fn write_fixed_header(first_byte: u8, content_size: u32, dst: &mut BytesMut) {
    dst.put_u8(first_byte);
    write_variable_length(content_size, dst);
}

#[inline]
fn write_packet_id(
    first_byte: u8,
    packet_id: std::num::NonZeroU16,
    content_size: u32,
    dst: &mut BytesMut,
) {
    write_fixed_header(first_byte, content_size, dst);
    dst.put_u16(packet_id.get());
}

fn write_variable_length(size: u32, dst: &mut BytesMut) {
    if size <= 127 {
        dst.put_u8(size as u8);
    } else if size <= 16383 {
        // 127 + 127 << 7
        dst.put_slice(&[((size % 128) | 0x80) as u8, (size >> 7) as u8]);
    } else if size <= 2097151 {
        // 127 + 127 << 7 + 127 << 14
        dst.put_slice(&[
            ((size % 128) | 0x80) as u8,
            (((size >> 7) % 128) | 0x80) as u8,
            (size >> 14) as u8,
        ]);
    } else {
        dst.put_slice(&[
            ((size % 128) | 0x80) as u8,
            (((size >> 7) % 128) | 0x80) as u8,
            (((size >> 14) % 128) | 0x80) as u8,
            (size >> 21) as u8,
        ]);
    }
}

#[inline]
fn write_str(s: &ByteString, dst: &mut BytesMut) {
    write_slice(s.as_bytes(), dst);
}

#[inline]
fn write_slice(s: &[u8], dst: &mut BytesMut) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s);
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use ntex_bytes::Bytes;

    use super::*;
    use crate::types::ProtocolLevel;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    macro_rules! assert_encode_packet (
        ($packet:expr, $expected:expr) => {{
            let size = get_encoded_size(&$packet);
            let mut v = BytesMut::with_capacity(size + 5);
            encode(&$packet, &mut v, size as u32).unwrap();
            assert_eq!(&v[..], &$expected[..]);
        }};
    );

    #[test]
    fn test_encode_variable_length() {
        let mut v = BytesMut::new();

        write_variable_length(123, &mut v);
        assert_eq!(&v[..], b"\x7b");

        v.clear();
        write_variable_length(129, &mut v);
        assert_eq!(&v[..], b"\x81\x01");

        v.clear();
        write_variable_length(16383, &mut v);
        assert_eq!(&v[..], b"\xff\x7f");

        v.clear();
        write_variable_length(2097151, &mut v);
        assert_eq!(&v[..], b"\xff\xff\x7f");

        v.clear();
        write_variable_length(268435455, &mut v);
        assert_eq!(&v[..], b"\xff\xff\xff\x7f");
    }

    #[test]
    fn test_encode_connect_packets() {
        assert_encode_packet!(
            Packet::Connect(Box::new(Connect {
                protocol_level: ProtocolLevel::V3_1_1,
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: None,
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
            })),
            b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"
        );

        assert_encode_packet!(
            Packet::Connect(Box::new(Connect {
                protocol_level: ProtocolLevel::V3_1,
                clean_session: true,
                keep_alive: 60,
                client_id: ByteString::from_static("shelly25"),
                last_will: None,
                username: None,
                password: None,
            })),
            b"\x10\x16\x00\x06MQIsdp\x03\x02\x00\x3C\x00\x08shelly25"
        );

        assert_encode_packet!(
            Packet::ConnectAck {
                session_present: true,
                return_code: super::super::packet::ConnectAckReason::ConnectionAccepted,
            },
            b"\x20\x02\x01\x00"
        );

        assert_encode_packet!(Packet::Disconnect, b"\xe0\x00");
    }

    #[test]
    fn test_encode_publish_packets() {
        assert_encode_packet!(
            Packet::Publish(Publish {
                dup: true,
                retain: true,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("topic"),
                packet_id: Some(packet_id(0x4321)),
                payload: Bytes::from_static(b"data"),
            }),
            b"\x3d\x0D\x00\x05topic\x43\x21data"
        );

        assert_encode_packet!(
            Packet::Publish(Publish {
                dup: false,
                retain: false,
                qos: QoS::AtMostOnce,
                topic: ByteString::from_static("topic"),
                packet_id: None,
                payload: Bytes::from_static(b"data"),
            }),
            b"\x30\x0b\x00\x05topicdata"
        );

        assert_encode_packet!(
            Packet::PublishAck { packet_id: packet_id(0x4321) },
            b"\x40\x02\x43\x21"
        );
        assert_encode_packet!(
            Packet::PublishReceived { packet_id: packet_id(0x4321) },
            b"\x50\x02\x43\x21"
        );
        assert_encode_packet!(
            Packet::PublishRelease { packet_id: packet_id(0x4321) },
            b"\x62\x02\x43\x21"
        );
        assert_encode_packet!(
            Packet::PublishComplete { packet_id: packet_id(0x4321) },
            b"\x70\x02\x43\x21"
        );
    }

    #[test]
    fn test_encode_subscribe_packets() {
        assert_encode_packet!(
            Packet::Subscribe {
                packet_id: packet_id(0x1234),
                topic_filters: vec![
                    (ByteString::from_static("test"), QoS::AtLeastOnce),
                    (ByteString::from_static("filter"), QoS::ExactlyOnce),
                ],
            },
            b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02"
        );

        assert_encode_packet!(
            Packet::SubscribeAck {
                packet_id: packet_id(0x1234),
                status: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                    SubscribeReturnCode::Success(QoS::ExactlyOnce),
                ],
            },
            b"\x90\x05\x12\x34\x01\x80\x02"
        );

        assert_encode_packet!(
            Packet::Unsubscribe {
                packet_id: packet_id(0x1234),
                topic_filters: vec![
                    ByteString::from_static("test"),
                    ByteString::from_static("filter"),
                ],
            },
            b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter"
        );

        assert_encode_packet!(
            Packet::UnsubscribeAck { packet_id: packet_id(0x4321) },
            b"\xb0\x02\x43\x21"
        );
    }

    #[test]
    fn test_encode_ping_packets() {
        assert_encode_packet!(Packet::PingRequest, b"\xc0\x00");
        assert_encode_packet!(Packet::PingResponse, b"\xd0\x00");
    }

    #[test]
    fn test_publish_without_packet_id() {
        let packet = Packet::Publish(Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: ByteString::from_static("topic"),
            packet_id: None,
            payload: Bytes::new(),
        });
        let mut v = BytesMut::new();
        assert_eq!(
            encode(&packet, &mut v, get_encoded_size(&packet) as u32),
            Err(EncodeError::PacketIdRequired)
        );
    }
}
