//! MQTT gateway for Shelly smart relay and light devices.
//!
//! The gateway is the server side of the MQTT protocol: Shelly devices
//! connect to it, authenticate and subscribe, and the gateway polls them
//! for status and forwards switch and light commands from the backend.

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod ipc;
pub mod server;
pub mod session;
pub mod status;
mod types;

pub use crate::codec::{ProtocolLevel, QoS};
pub use crate::config::{
    load_worker_config, ConfigStore, FileConfigStore, MqttConfig, ShellyServerConfig,
};
pub use crate::device::{DeviceSession, SetLight, SetSwitch, GATEWAY_ENDPOINT};
pub use crate::error::{
    DecodeError, EncodeError, GatewayError, ProtocolError, SendPacketError, StoreError,
};
pub use crate::ipc::{IpcBus, LoggingBus};
pub use crate::server::{
    command_channel, gateway_factory, CommandReceiver, CommandSender, GatewayCommand,
    GatewayServer,
};
pub use crate::session::{MqttSink, ProtocolSession, SessionConfig, SessionHandler};
pub use crate::status::{Health, StatusRegistry, StatusReporter};
