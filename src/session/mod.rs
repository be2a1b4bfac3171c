//! MQTT server-role protocol session
//!
//! One `ProtocolSession` owns one device connection. It drives the codec
//! over the io stream, applies the v3 server state machine and keeps QoS
//! delivery promises through the retry ledger. Domain behavior plugs in
//! through [`SessionHandler`].

use std::cell::{Cell, RefCell};
use std::num::NonZeroU16;
use std::rc::Rc;

use ntex_bytes::{ByteString, Bytes};
use ntex_io::{Io, IoRef};
use ntex_util::future::{select, Either};
use ntex_util::time::{sleep, Millis};

use crate::codec::{
    Codec, Connect, ConnectAckReason, Packet, ProtocolLevel, Publish, QoS,
    SubscribeReturnCode,
};
use crate::error::{EncodeError, ProtocolError, SendPacketError};

mod ledger;

use self::ledger::{Ledger, Stage};

/// Delay between redeliveries of an unacknowledged packet
pub const RETRY_DELAY: Millis = Millis(5000);
/// Redelivery attempts per packet before giving up
pub const MAX_RETRIES: u16 = 10;

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub password: String,
    pub retry_delay: Millis,
    pub max_retries: u16,
}

impl SessionConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        SessionConfig {
            username: username.into(),
            password: password.into(),
            retry_delay: RETRY_DELAY,
            max_retries: MAX_RETRIES,
        }
    }

    /// Override the redelivery delay
    pub fn retry_delay(mut self, delay: Millis) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Override the redelivery budget
    pub fn max_retries(mut self, count: u16) -> Self {
        self.max_retries = count;
        self
    }
}

/// Packet id allocator, counts 1..=65535 and wraps back to 1.
///
/// Wraparound does not check whether the reused id is still armed; a
/// collision after 65535 unacknowledged deliveries supersedes the stale
/// ledger entry.
#[derive(Debug)]
pub(crate) struct IdAllocator(Cell<u16>);

impl IdAllocator {
    fn new() -> Self {
        IdAllocator(Cell::new(1))
    }

    fn next(&self) -> NonZeroU16 {
        let id = self.0.get();
        self.0.set(if id == u16::MAX { 1 } else { id + 1 });
        NonZeroU16::new(id).unwrap()
    }
}

pub(crate) struct SessionShared {
    io: IoRef,
    codec: Codec,
    config: SessionConfig,
    client_id: RefCell<ByteString>,
    next_id: IdAllocator,
    ledger: Ledger,
}

impl SessionShared {
    fn new(io: IoRef, config: SessionConfig) -> SessionShared {
        SessionShared {
            io,
            config,
            codec: Codec::new(),
            client_id: RefCell::new(ByteString::from_static("unknown")),
            next_id: IdAllocator::new(),
            ledger: Ledger::default(),
        }
    }

    fn encode_packet(&self, pkt: Packet) -> Result<(), EncodeError> {
        self.io.encode(pkt, &self.codec)
    }

    fn is_closed(&self) -> bool {
        self.io.is_closed()
    }

    fn close(&self) {
        self.ledger.clear();
        self.io.close();
    }

    fn force_close(&self) {
        self.ledger.clear();
        self.io.force_close();
    }
}

fn spawn_retry(shared: Rc<SessionShared>, packet_id: NonZeroU16, epoch: u64) {
    let _ = ntex_rt::spawn(async move {
        loop {
            sleep(shared.config.retry_delay).await;
            if shared.is_closed() {
                break;
            }
            match shared.ledger.next_resend(packet_id, epoch, shared.config.max_retries) {
                Some(packet) => {
                    log::trace!("Redelivering packet id {}", packet_id);
                    if shared.encode_packet(packet).is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });
}

/// Handle for publishing to and closing a device connection
pub struct MqttSink(Rc<SessionShared>);

impl Clone for MqttSink {
    fn clone(&self) -> Self {
        MqttSink(self.0.clone())
    }
}

impl MqttSink {
    /// Check if the io stream is open
    pub fn is_open(&self) -> bool {
        !self.0.is_closed()
    }

    /// Client identifier announced by the peer, `"unknown"` before Connect
    pub fn client_id(&self) -> ByteString {
        self.0.client_id.borrow().clone()
    }

    /// Protocol level of the connected peer
    pub fn protocol_level(&self) -> ProtocolLevel {
        self.0.codec.protocol_level()
    }

    /// Close the connection, dropping all pending redeliveries
    pub fn close(&self) {
        self.0.close();
    }

    /// Close the connection without flushing pending writes
    pub fn force_close(&self) {
        self.0.force_close();
    }

    /// Publish a message to the device.
    ///
    /// Always writes immediately. For QoS above 0 a packet id is allocated
    /// and the packet is kept for redelivery until the peer acknowledges it.
    pub fn publish(
        &self,
        topic: ByteString,
        payload: Bytes,
        qos: QoS,
    ) -> Result<(), SendPacketError> {
        let shared = &self.0;
        if shared.is_closed() {
            log::error!("Mqtt sink is disconnected");
            return Err(SendPacketError::Disconnected);
        }

        let packet_id =
            if qos == QoS::AtMostOnce { None } else { Some(shared.next_id.next()) };
        let publish = Publish { dup: false, retain: false, qos, topic, packet_id, payload };

        log::trace!("Publish (QoS-{}) to {:?}", u8::from(qos), publish.topic);
        shared.encode_packet(Packet::Publish(publish.clone()))?;

        if let Some(id) = packet_id {
            if let Some(epoch) = shared.ledger.arm(id, Stage::Publish(publish)) {
                spawn_retry(shared.clone(), id, epoch);
            }
        }
        Ok(())
    }
}

/// Domain callbacks invoked by the session state machine
pub trait SessionHandler {
    /// A Connect handshake with valid credentials completed
    fn connected(&self, sink: &MqttSink) {
        let _ = sink;
    }

    /// A Subscribe packet was acknowledged, with its topic filters
    fn subscribed(&self, sink: &MqttSink, topics: &[ByteString]) {
        let _ = (sink, topics);
    }

    /// An inbound Publish arrived, any QoS
    fn received(&self, sink: &MqttSink, topic: &ByteString, payload: &Bytes) {
        let _ = (sink, topic, payload);
    }

    /// The session terminated; no callback fires after this one
    fn closed(&self) {}
}

/// Server side of one MQTT connection
pub struct ProtocolSession {
    io: Io,
    shared: Rc<SessionShared>,
    connected: Cell<bool>,
    /// idle timeout in milliseconds, 0 disables it
    idle: Cell<u32>,
}

impl ProtocolSession {
    pub fn new(io: Io, config: SessionConfig) -> Self {
        let shared = Rc::new(SessionShared::new(io.get_ref(), config));
        ProtocolSession { io, shared, connected: Cell::new(false), idle: Cell::new(0) }
    }

    /// Get a sink handle; the sink stays valid after `run` returns
    pub fn sink(&self) -> MqttSink {
        MqttSink(self.shared.clone())
    }

    /// Drive the session until the connection terminates.
    ///
    /// On return the ledger is cleared, no redelivery fires afterwards, and
    /// the handler received its `closed` callback.
    pub async fn run<H: SessionHandler>(self, handler: H) -> Result<(), ProtocolError> {
        let result = self.dispatch(&handler).await;
        self.shared.ledger.clear();
        handler.closed();
        result
    }

    async fn dispatch<H: SessionHandler>(&self, handler: &H) -> Result<(), ProtocolError> {
        loop {
            let idle = self.idle.get();
            let recv = self.io.recv(&self.shared.codec);
            let packet = if idle == 0 {
                recv.await
            } else {
                match select(sleep(Millis(idle)), recv).await {
                    Either::Left(_) => {
                        log::trace!(
                            "Client {:?} keep-alive timed out, closing connection",
                            self.shared.client_id.borrow()
                        );
                        self.shared.close();
                        return Ok(());
                    }
                    Either::Right(res) => res,
                }
            };

            match packet {
                Ok(Some(packet)) => {
                    if !self.handle_packet(packet, handler)? {
                        return Ok(());
                    }
                }
                // peer closed the stream
                Ok(None) => return Ok(()),
                Err(Either::Left(err)) => {
                    log::error!(
                        "Failed to parse packet from client {:?}: {}",
                        self.shared.client_id.borrow(),
                        err
                    );
                    self.shared.force_close();
                    return Err(ProtocolError::Decode(err));
                }
                Err(Either::Right(err)) => {
                    log::error!(
                        "Connection error in client {:?}: {}",
                        self.shared.client_id.borrow(),
                        err
                    );
                    self.shared.force_close();
                    return Err(ProtocolError::Disconnected(Some(err)));
                }
            }
        }
    }

    /// Apply one packet; returns false once the session should stop
    fn handle_packet<H: SessionHandler>(
        &self,
        packet: Packet,
        handler: &H,
    ) -> Result<bool, ProtocolError> {
        match packet {
            Packet::Connect(pkt) => self.handle_connect(*pkt, handler)?,

            Packet::Disconnect => {
                log::trace!("Client {:?} disconnected", self.shared.client_id.borrow());
                self.shared.close();
                return Ok(false);
            }

            packet if !self.connected.get() => {
                log::warn!(
                    "Packet from client {:?} before Connect handshake, ignoring: {:?}",
                    self.shared.client_id.borrow(),
                    packet
                );
            }

            Packet::PingRequest => {
                self.shared.encode_packet(Packet::PingResponse)?;
            }

            Packet::Subscribe { packet_id, topic_filters } => {
                let topics: Vec<ByteString> =
                    topic_filters.iter().map(|(topic, _)| topic.clone()).collect();
                let status = topic_filters
                    .iter()
                    .map(|(_, qos)| SubscribeReturnCode::Success(*qos))
                    .collect();
                self.shared.encode_packet(Packet::SubscribeAck { packet_id, status })?;
                handler.subscribed(&self.sink(), &topics);
            }

            Packet::Unsubscribe { packet_id, .. } => {
                self.shared.encode_packet(Packet::UnsubscribeAck { packet_id })?;
            }

            Packet::Publish(publish) => {
                match publish.qos {
                    QoS::AtMostOnce => (),
                    QoS::AtLeastOnce => {
                        if let Some(packet_id) = publish.packet_id {
                            self.shared.encode_packet(Packet::PublishAck { packet_id })?;
                        }
                    }
                    QoS::ExactlyOnce => {
                        if let Some(packet_id) = publish.packet_id {
                            self.shared
                                .encode_packet(Packet::PublishReceived { packet_id })?;
                            if let Some(epoch) =
                                self.shared.ledger.arm(packet_id, Stage::Receive)
                            {
                                spawn_retry(self.shared.clone(), packet_id, epoch);
                            }
                        }
                    }
                }
                handler.received(&self.sink(), &publish.topic, &publish.payload);
            }

            Packet::PublishAck { packet_id } => {
                if self.shared.ledger.at_stage(packet_id, |s| matches!(s, Stage::Publish(_)))
                {
                    self.shared.ledger.disarm(packet_id);
                } else {
                    log::trace!("Unsolicited PubAck for packet id {}, ignoring", packet_id);
                }
            }

            Packet::PublishReceived { packet_id } => {
                if self.shared.ledger.at_stage(packet_id, |s| matches!(s, Stage::Publish(_)))
                {
                    self.shared.encode_packet(Packet::PublishRelease { packet_id })?;
                    if let Some(epoch) = self.shared.ledger.arm(packet_id, Stage::Release) {
                        spawn_retry(self.shared.clone(), packet_id, epoch);
                    }
                } else {
                    log::trace!("Unsolicited PubRec for packet id {}, ignoring", packet_id);
                }
            }

            Packet::PublishRelease { packet_id } => {
                if self.shared.ledger.at_stage(packet_id, |s| *s == Stage::Receive) {
                    self.shared.ledger.disarm(packet_id);
                    self.shared.encode_packet(Packet::PublishComplete { packet_id })?;
                } else {
                    log::trace!("Unsolicited PubRel for packet id {}, ignoring", packet_id);
                }
            }

            Packet::PublishComplete { packet_id } => {
                if self.shared.ledger.at_stage(packet_id, |s| *s == Stage::Release) {
                    self.shared.ledger.disarm(packet_id);
                } else {
                    log::trace!("Unsolicited PubComp for packet id {}, ignoring", packet_id);
                }
            }

            packet => {
                // server-role session, these only make sense from a server
                log::warn!(
                    "Unexpected packet from client {:?}, ignoring: {:?}",
                    self.shared.client_id.borrow(),
                    packet
                );
            }
        }
        Ok(true)
    }

    fn handle_connect<H: SessionHandler>(
        &self,
        pkt: Connect,
        handler: &H,
    ) -> Result<(), ProtocolError> {
        *self.shared.client_id.borrow_mut() = pkt.client_id.clone();
        // keep-alive x 1.5, keep-alive 0 disables the idle timeout
        self.idle.set(u32::from(pkt.keep_alive) * 1500);

        let authenticated = pkt.username.as_deref()
            == Some(self.shared.config.username.as_str())
            && pkt.password.as_deref() == Some(self.shared.config.password.as_bytes());

        if authenticated {
            log::info!(
                "Device '{}' connected, protocol level {}",
                pkt.client_id,
                pkt.protocol_level.level()
            );
            self.shared.encode_packet(Packet::ConnectAck {
                session_present: false,
                return_code: ConnectAckReason::ConnectionAccepted,
            })?;
            self.connected.set(true);
            handler.connected(&self.sink());
        } else {
            log::warn!("Invalid credentials from client '{}'", pkt.client_id);
            self.shared.encode_packet(Packet::ConnectAck {
                session_present: false,
                return_code: ConnectAckReason::BadUserNameOrPassword,
            })?;
            // the transport stays open, the idle timeout reaps it
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_allocator_wraps_skipping_zero() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next().get(), 1);
        assert_eq!(ids.next().get(), 2);

        for _ in 0..u16::MAX - 3 {
            ids.next();
        }
        assert_eq!(ids.next().get(), u16::MAX);
        assert_eq!(ids.next().get(), 1);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("user", "pass");
        assert_eq!(config.max_retries, MAX_RETRIES);
        assert_eq!(config.retry_delay, RETRY_DELAY);

        let config = config.retry_delay(Millis(25)).max_retries(3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Millis(25));
    }
}
