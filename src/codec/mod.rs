//! MQTT v3.1 / v3.1.1 packet codec

#[allow(clippy::module_inception)]
mod codec;
mod decode;
mod encode;
mod packet;

pub use self::codec::Codec;
pub use self::packet::{
    Connect, ConnectAckReason, LastWill, Packet, Publish, SubscribeReturnCode,
};

pub use crate::error::{DecodeError, EncodeError};
pub use crate::types::{ProtocolLevel, QoS};
