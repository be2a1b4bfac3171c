use std::cell::Cell;

use ntex_bytes::BytesMut;
use ntex_codec::{Decoder, Encoder};

use super::{decode, encode, Packet};
use crate::error::{DecodeError, EncodeError};
use crate::types::{FixedHeader, ProtocolLevel};

/// Mqtt v3.1 / v3.1.1 protocol codec
#[derive(Debug)]
pub struct Codec {
    state: Cell<DecodeState>,
    max_size: Cell<u32>,
    level: Cell<ProtocolLevel>,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    /// Create `Codec` instance
    pub fn new() -> Self {
        Codec {
            state: Cell::new(DecodeState::FrameHeader),
            max_size: Cell::new(0),
            level: Cell::new(ProtocolLevel::default()),
        }
    }

    /// Set max inbound frame size.
    ///
    /// If max size is set to `0`, size is unlimited.
    /// By default max size is set to `0`
    pub fn set_max_size(&self, size: u32) {
        self.max_size.set(size);
    }

    /// Protocol level declared by the last decoded Connect packet.
    ///
    /// Defaults to level 4 (v3.1.1) until a Connect is observed.
    pub fn protocol_level(&self) -> ProtocolLevel {
        self.level.get()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new()
    }
}

impl Decoder for Codec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    match decode::decode_variable_length(&src[1..])? {
                        Some((remaining_length, consumed)) => {
                            let max_size = self.max_size.get();
                            if max_size != 0 && remaining_length > max_size {
                                return Err(DecodeError::MaxSizeExceeded);
                            }
                            let _ = src.split_to(consumed + 1);
                            self.state.set(DecodeState::Frame(FixedHeader {
                                first_byte,
                                remaining_length,
                            }));
                        }
                        None => return Ok(None),
                    }
                }
                DecodeState::Frame(fixed) => {
                    if src.len() < fixed.remaining_length as usize {
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(fixed.remaining_length as usize).freeze();
                    let packet = decode::decode_packet(packet_buf, fixed.first_byte)?;
                    self.state.set(DecodeState::FrameHeader);
                    src.reserve(2);

                    if let Packet::Connect(ref connect) = packet {
                        self.level.set(connect.protocol_level);
                    }
                    return Ok(Some(packet));
                }
            }
        }
    }
}

impl Encoder for Codec {
    type Item = Packet;
    type Error = EncodeError;

    fn encode(&self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let content_size = encode::get_encoded_size(&item);
        dst.reserve(content_size + 5);
        encode::encode(&item, dst, content_size as u32)
    }
}
