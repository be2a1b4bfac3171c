//! Gateway server.
//!
//! One listener accepts device connections, runs a protocol session per
//! connection and keeps the set of connected devices. Commands from the
//! backend arrive on an in-process channel and fan out to every device;
//! each device decides by MAC address whether a command is its own.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use ntex::service::fn_service;
use ntex_io::Io;
use tokio::sync::mpsc;

use crate::config::MqttConfig;
use crate::device::{DeviceSession, SetLight, SetSwitch, GATEWAY_ENDPOINT};
use crate::error::GatewayError;
use crate::ipc::IpcBus;
use crate::session::{ProtocolSession, SessionConfig};
use crate::status::{Health, StatusRegistry};

/// Command addressed to a single device, selected by MAC address
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    SetSwitch { mac: String, params: SetSwitch },
    SetLight { mac: String, params: SetLight },
}

/// Sending half of the command channel, held by the backend integration
pub struct CommandSender(mpsc::UnboundedSender<GatewayCommand>);

impl Clone for CommandSender {
    fn clone(&self) -> Self {
        CommandSender(self.0.clone())
    }
}

impl CommandSender {
    /// false when the gateway worker is gone
    pub fn send(&self, command: GatewayCommand) -> bool {
        self.0.send(command).is_ok()
    }
}

/// Receiving half, claimed once by the worker thread
pub struct CommandReceiver(Arc<Mutex<Option<mpsc::UnboundedReceiver<GatewayCommand>>>>);

impl Clone for CommandReceiver {
    fn clone(&self) -> Self {
        CommandReceiver(self.0.clone())
    }
}

impl CommandReceiver {
    fn take(&self) -> Option<mpsc::UnboundedReceiver<GatewayCommand>> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender(tx), CommandReceiver(Arc::new(Mutex::new(Some(rx)))))
}

struct GatewayState {
    session_config: SessionConfig,
    registry: StatusRegistry,
    devices: RefCell<Vec<DeviceSession>>,
}

impl GatewayState {
    async fn handle(self: Rc<Self>, io: Io) -> Result<(), GatewayError> {
        let peer = io.query::<ntex_io::types::PeerAddr>().get();

        // drop sessions that went away before tracking the new one
        self.devices.borrow_mut().retain(|device| {
            if device.is_connected() {
                true
            } else {
                device.stop();
                false
            }
        });

        let session = ProtocolSession::new(io, self.session_config.clone());
        let device = DeviceSession::new(session.sink(), self.registry.clone());
        self.devices.borrow_mut().push(device.clone());
        log::info!(
            "Connection from {:?} accepted, {} devices tracked",
            peer,
            self.devices.borrow().len()
        );

        if let Err(err) = session.run(device).await {
            log::error!("Device session terminated: {}", err);
        }
        Ok(())
    }

    fn dispatch(&self, command: GatewayCommand) {
        log::info!("Command received: {:?}", command);
        let devices = self.devices.borrow();
        match &command {
            GatewayCommand::SetSwitch { mac, params } => {
                for device in devices.iter() {
                    device.set_switch(mac, params);
                }
            }
            GatewayCommand::SetLight { mac, params } => {
                for device in devices.iter() {
                    device.set_light(mac, params);
                }
            }
        }
    }
}

/// Build the per worker connection service. Claims the command receiver,
/// starts the command pump and the status push task.
pub fn gateway_factory<B: IpcBus + 'static>(
    config: MqttConfig,
    session_config: SessionConfig,
    commands: CommandReceiver,
    bus: B,
) -> impl ntex::service::ServiceFactory<Io, Response = (), Error = GatewayError, InitError = ()> {
    let registry = StatusRegistry::new(bus);
    let state = Rc::new(GatewayState {
        session_config,
        registry: registry.clone(),
        devices: RefCell::new(Vec::new()),
    });

    let reporter = registry.get_or_create(GATEWAY_ENDPOINT);
    reporter.start("worker");
    reporter.set_details(&serde_json::json!({
        "hostname": config.hostname,
        "port": config.port,
    }));
    reporter.set_health(Health::Running);
    registry.spawn_reporting();

    if let Some(mut receiver) = commands.take() {
        let state = state.clone();
        let _ = ntex_rt::spawn(async move {
            while let Some(command) = receiver.recv().await {
                state.dispatch(command);
            }
        });
    }

    fn_service(move |io: Io| {
        let state = state.clone();
        async move { state.handle(io).await }
    })
}

/// Running gateway listener
pub struct GatewayServer {
    server: ntex::server::Server,
}

impl GatewayServer {
    /// Bind the listener. A single worker keeps all device state on one
    /// thread.
    pub fn bind<B>(
        config: MqttConfig,
        commands: CommandReceiver,
        bus: B,
    ) -> std::io::Result<GatewayServer>
    where
        B: IpcBus + Clone + Send + 'static,
    {
        let addr = (config.hostname.clone(), config.port);
        let session_config =
            SessionConfig::new(config.username.clone(), config.password.clone());
        log::info!("Starting MQTT listener on {}:{}", config.hostname, config.port);

        let server = ntex::server::build()
            .bind("shelly-mqtt", addr, move |_| {
                gateway_factory(
                    config.clone(),
                    session_config.clone(),
                    commands.clone(),
                    bus.clone(),
                )
            })?
            .workers(1)
            .run();
        Ok(GatewayServer { server })
    }

    /// Wait for the server to finish
    pub async fn run(self) -> std::io::Result<()> {
        self.server.await
    }

    /// Stop accepting connections; graceful stop lets running sessions
    /// drain first.
    pub async fn stop(&self, graceful: bool) {
        self.server.stop(graceful).await;
    }

    /// Close the listener and bind again with new settings
    pub async fn rebind<B>(
        self,
        config: MqttConfig,
        commands: CommandReceiver,
        bus: B,
    ) -> std::io::Result<GatewayServer>
    where
        B: IpcBus + Clone + Send + 'static,
    {
        self.server.stop(true).await;
        GatewayServer::bind(config, commands, bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_receiver_claimed_once() {
        let (tx, rx) = command_channel();
        assert!(tx.send(GatewayCommand::SetSwitch {
            mac: "AABBCC".to_string(),
            params: SetSwitch { id: 0, on: true },
        }));

        assert!(rx.take().is_some());
        assert!(rx.take().is_none());
        assert!(rx.clone().take().is_none());
    }
}
