use std::num::NonZeroU16;

use ntex_bytes::{ByteString, Bytes};

use crate::types::{ProtocolLevel, QoS};

/// Connection Will
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LastWill {
    /// The QoS level to be used when publishing the Will Message.
    pub qos: QoS,
    /// If set to true, the Will Message MUST be published with retain flag.
    pub retain: bool,
    /// The Will Topic.
    pub topic: ByteString,
    /// The Will Message.
    pub message: Bytes,
}

/// Connect packet content
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Connect {
    /// Mqtt protocol level declared by the peer
    pub protocol_level: ProtocolLevel,
    /// the handling of the Session state
    pub clean_session: bool,
    /// a time interval measured in seconds
    pub keep_alive: u16,
    /// Will Message be stored on the Server and associated with the Network Connection
    pub last_will: Option<LastWill>,
    /// identifies the Client to the Server
    pub client_id: ByteString,
    /// username can be used by the Server for authentication and authorization
    pub username: Option<ByteString>,
    /// password can be used by the Server for authentication and authorization
    pub password: Option<Bytes>,
}

/// Publish message
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Publish {
    /// this might be re-delivery of an earlier attempt to send the Packet.
    pub dup: bool,
    pub retain: bool,
    /// the level of assurance for delivery of an Application Message.
    pub qos: QoS,
    /// the information channel to which payload data is published.
    pub topic: ByteString,
    /// only present in PUBLISH Packets where the QoS level is 1 or 2.
    pub packet_id: Option<NonZeroU16>,
    /// the Application Message that is being published.
    pub payload: Bytes,
}

/// Connect Return Code
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ConnectAckReason {
    ConnectionAccepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServiceUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
    Reserved,
}

impl From<u8> for ConnectAckReason {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnectAckReason::ConnectionAccepted,
            1 => ConnectAckReason::UnacceptableProtocolVersion,
            2 => ConnectAckReason::IdentifierRejected,
            3 => ConnectAckReason::ServiceUnavailable,
            4 => ConnectAckReason::BadUserNameOrPassword,
            5 => ConnectAckReason::NotAuthorized,
            _ => ConnectAckReason::Reserved,
        }
    }
}

impl ConnectAckReason {
    pub fn reason_code(self) -> u8 {
        match self {
            ConnectAckReason::ConnectionAccepted => 0,
            ConnectAckReason::UnacceptableProtocolVersion => 1,
            ConnectAckReason::IdentifierRejected => 2,
            ConnectAckReason::ServiceUnavailable => 3,
            ConnectAckReason::BadUserNameOrPassword => 4,
            ConnectAckReason::NotAuthorized => 5,
            ConnectAckReason::Reserved => 6,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => {
                "protocol version is not supported"
            }
            ConnectAckReason::IdentifierRejected => "client identifier is invalid",
            ConnectAckReason::ServiceUnavailable => "Service unavailable",
            ConnectAckReason::BadUserNameOrPassword => "bad user name or password",
            ConnectAckReason::NotAuthorized => "not authorized",
            ConnectAckReason::Reserved => "Reserved",
        }
    }
}

/// Subscribe Return Code
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

/// MQTT Control Packets
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Client request to connect to Server
    Connect(Box<Connect>),

    /// Connect acknowledgment
    ConnectAck {
        /// enables a Client to establish if the Client and Server have a consistent view
        /// about whether there is already stored Session state.
        session_present: bool,
        return_code: ConnectAckReason,
    },

    /// Publish message
    Publish(Publish),

    /// Publish acknowledgment
    PublishAck {
        /// Packet Identifier
        packet_id: NonZeroU16,
    },
    /// Publish received (assured delivery part 1)
    PublishReceived {
        /// Packet Identifier
        packet_id: NonZeroU16,
    },
    /// Publish release (assured delivery part 2)
    PublishRelease {
        /// Packet Identifier
        packet_id: NonZeroU16,
    },
    /// Publish complete (assured delivery part 3)
    PublishComplete {
        /// Packet Identifier
        packet_id: NonZeroU16,
    },

    /// Client subscribe request
    Subscribe {
        /// Packet Identifier
        packet_id: NonZeroU16,
        /// the list of Topic Filters and QoS to which the Client wants to subscribe.
        topic_filters: Vec<(ByteString, QoS)>,
    },
    /// Subscribe acknowledgment
    SubscribeAck {
        packet_id: NonZeroU16,
        /// corresponds to a Topic Filter in the SUBSCRIBE Packet being acknowledged.
        status: Vec<SubscribeReturnCode>,
    },

    /// Unsubscribe request
    Unsubscribe {
        /// Packet Identifier
        packet_id: NonZeroU16,
        /// the list of Topic Filters that the Client wishes to unsubscribe from.
        topic_filters: Vec<ByteString>,
    },
    /// Unsubscribe acknowledgment
    UnsubscribeAck {
        /// Packet Identifier
        packet_id: NonZeroU16,
    },

    /// PING request
    PingRequest,
    /// PING response
    PingResponse,

    /// Client is disconnecting
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}
