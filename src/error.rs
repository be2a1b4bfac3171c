use std::io;

/// Errors which can occur when attempting to decode an mqtt packet
#[derive(Debug, PartialEq, Eq, Copy, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid protocol name")]
    InvalidProtocol,
    #[error("Unsupported protocol level")]
    UnsupportedProtocolLevel,
    #[error("Invalid length")]
    InvalidLength,
    #[error("Invalid QoS value: {0}")]
    InvalidQoS(u8),
    #[error("Connect packet reserved flag is set")]
    ConnectReservedFlagSet,
    #[error("ConnAck packet reserved flag is set")]
    ConnAckReservedFlagSet,
    #[error("Invalid client id")]
    InvalidClientId,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Unsupported packet type")]
    UnsupportedPacketType,
    #[error("Packet id is required")]
    PacketIdRequired,
    #[error("Max size exceeded")]
    MaxSizeExceeded,
    #[error("Utf8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

/// Errors which can occur when attempting to encode an mqtt packet
#[derive(Debug, PartialEq, Eq, Copy, Clone, thiserror::Error)]
pub enum EncodeError {
    #[error("Packet is bigger than max size")]
    InvalidLength,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Packet id is required")]
    PacketIdRequired,
}

/// Errors which can occur when sending a packet through a session sink
#[derive(Debug, thiserror::Error)]
pub enum SendPacketError {
    /// Encoder error
    #[error("Encoding error {0:?}")]
    Encode(#[from] EncodeError),
    /// Peer disconnected
    #[error("Peer is disconnected")]
    Disconnected,
}

/// Protocol level errors, all of them are fatal for the connection
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Mqtt parse error
    #[error("Decode error: {0:?}")]
    Decode(#[from] DecodeError),
    /// Mqtt encode error
    #[error("Encode error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Peer disconnect
    #[error("Peer is disconnected, error: {0:?}")]
    Disconnected(Option<io::Error>),
}

/// Errors which can occur when loading worker configuration
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid config document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Gateway level errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
