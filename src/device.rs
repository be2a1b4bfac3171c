//! Shelly device semantics above a protocol session.
//!
//! A connected device announces itself with its client id (the device name),
//! subscribes to `<name>/rpc` and is polled for its status over the Shelly
//! RPC protocol. Status replies arrive on `shellyserver/rpc`, component
//! telemetry on `<name>/status/<component>`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use ntex_bytes::{ByteString, Bytes};
use ntex_util::time::{sleep, Millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::QoS;
use crate::session::{MqttSink, SessionHandler};
use crate::status::{Health, StatusRegistry, StatusReporter};

/// Endpoint name of this worker, used as the `src` of outgoing RPCs
pub const GATEWAY_ENDPOINT: &str = "shellyserver";

/// Components per device a status report is scanned for
const MAX_COMPONENTS: usize = 4;

/// Delay between status re-polls of a connected device
const STATUS_POLL_DELAY: Millis = Millis(60_000);

/// Switch command payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSwitch {
    pub id: u32,
    pub on: bool,
}

/// Light command payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetLight {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum DeviceKind {
    Switch,
    Light,
}

/// Electrical telemetry of one switch or light component
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct ComponentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<bool>,
    #[serde(
        rename(deserialize = "apower"),
        skip_serializing_if = "Option::is_none",
        default
    )]
    power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    freq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness: Option<f64>,
}

/// Last known device state, pushed as status details
#[derive(Debug, Default, Serialize)]
struct DeviceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<DeviceKind>,
    #[serde(flatten)]
    components: BTreeMap<String, ComponentStatus>,
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    id: &'a str,
    src: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a P>,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: String,
    #[serde(default)]
    result: Option<Value>,
}

/// Record a full `Shelly.GetStatus` result; false when the report carries
/// no MAC address, which makes the device unaddressable.
fn apply_device_status(status: &mut DeviceStatus, result: &Value) -> bool {
    let Some(mac) = result.pointer("/sys/mac").and_then(Value::as_str) else {
        return false;
    };
    status.mac = Some(mac.to_string());
    status.ip = result
        .pointer("/eth/ip")
        .and_then(Value::as_str)
        .or_else(|| result.pointer("/wifi/sta_ip").and_then(Value::as_str))
        .map(str::to_string);
    status.rssi = result.pointer("/wifi/rssi").and_then(Value::as_i64);

    for idx in 0..MAX_COMPONENTS {
        for (kind, prefix) in [(DeviceKind::Switch, "switch"), (DeviceKind::Light, "light")] {
            let key = format!("{}:{}", prefix, idx);
            if let Some(component) = result.get(&key) {
                status.kind = Some(kind);
                match serde_json::from_value::<ComponentStatus>(component.clone()) {
                    Ok(component) => {
                        status.components.insert(key, component);
                    }
                    Err(err) => {
                        log::warn!("Dropping malformed component status {}: {}", key, err)
                    }
                }
            }
        }
    }
    true
}

struct DeviceInner {
    sink: MqttSink,
    registry: StatusRegistry,
    reporter: RefCell<Option<StatusReporter>>,
    status: RefCell<DeviceStatus>,
    /// bumping the epoch cancels the running status poll task
    poll_epoch: Cell<u64>,
}

/// One connected Shelly device
pub struct DeviceSession {
    inner: Rc<DeviceInner>,
}

impl Clone for DeviceSession {
    fn clone(&self) -> Self {
        DeviceSession { inner: self.inner.clone() }
    }
}

impl DeviceSession {
    pub fn new(sink: MqttSink, registry: StatusRegistry) -> Self {
        DeviceSession {
            inner: Rc::new(DeviceInner {
                sink,
                registry,
                reporter: RefCell::new(None),
                status: RefCell::new(DeviceStatus::default()),
                poll_epoch: Cell::new(0),
            }),
        }
    }

    /// Device name, the client id announced at Connect time
    pub fn name(&self) -> ByteString {
        self.inner.sink.client_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.sink.is_open()
    }

    /// Close the connection and cancel the status poll
    pub fn stop(&self) {
        self.inner.poll_epoch.set(self.inner.poll_epoch.get() + 1);
        self.inner.sink.close();
    }

    /// Turn a relay output on or off; only the device with a matching MAC
    /// address reacts, a non-switch device drops the command with a warning.
    pub fn set_switch(&self, mac: &str, params: &SetSwitch) {
        if !self.matches(mac, DeviceKind::Switch, "Switch.Set") {
            return;
        }
        self.send_rpc("Switch.Set", Some(params), QoS::AtMostOnce);
    }

    /// Set light output and brightness, guarded like [`Self::set_switch`]
    pub fn set_light(&self, mac: &str, params: &SetLight) {
        if !self.matches(mac, DeviceKind::Light, "Light.Set") {
            return;
        }
        self.send_rpc("Light.Set", Some(params), QoS::AtMostOnce);
    }

    fn matches(&self, mac: &str, kind: DeviceKind, method: &str) -> bool {
        let status = self.inner.status.borrow();
        if status.mac.as_deref() != Some(mac) {
            return false;
        }
        if status.kind != Some(kind) {
            log::warn!("Device '{}' cannot handle {}, dropping command", self.name(), method);
            return false;
        }
        true
    }

    fn send_rpc<P: Serialize>(&self, method: &str, params: Option<&P>, qos: QoS) {
        let request = RpcRequest { id: method, src: GATEWAY_ENDPOINT, method, params };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                log::error!("Failed to serialize {} request: {}", method, err);
                return;
            }
        };
        let topic = ByteString::from(format!("{}/rpc", self.name()));
        if let Err(err) = self.inner.sink.publish(topic, payload, qos) {
            log::error!("Failed to publish {} to device '{}': {}", method, self.name(), err);
        }
    }

    fn request_status(&self) {
        self.send_rpc::<()>("Shelly.GetStatus", None, QoS::AtLeastOnce);
    }

    fn start_status_poll(&self) {
        let epoch = self.inner.poll_epoch.get() + 1;
        self.inner.poll_epoch.set(epoch);

        let device = self.clone();
        let _ = ntex_rt::spawn(async move {
            loop {
                sleep(STATUS_POLL_DELAY).await;
                if device.inner.poll_epoch.get() != epoch || !device.is_connected() {
                    break;
                }
                device.request_status();
            }
        });
    }

    fn handle_device_status(&self, result: Option<&Value>) {
        let applied = match result {
            Some(result) => apply_device_status(&mut self.inner.status.borrow_mut(), result),
            None => false,
        };
        if !applied {
            log::error!("Device '{}' reported no MAC address, stopping", self.name());
            self.stop();
            return;
        }

        if let Some(reporter) = self.inner.reporter.borrow().as_ref() {
            reporter.set_health(Health::Running);
            reporter.set_details(&*self.inner.status.borrow());
        }
    }

    fn handle_component_status(&self, key: &str, payload: &Bytes) {
        match serde_json::from_slice::<ComponentStatus>(payload) {
            Ok(component) => {
                self.inner.status.borrow_mut().components.insert(key.to_string(), component);
                if let Some(reporter) = self.inner.reporter.borrow().as_ref() {
                    reporter.set_details(&*self.inner.status.borrow());
                }
            }
            Err(err) => log::warn!(
                "Malformed component status from device '{}' for {}: {}",
                self.name(),
                key,
                err
            ),
        }
    }
}

impl SessionHandler for DeviceSession {
    fn connected(&self, sink: &MqttSink) {
        let name = sink.client_id();
        let reporter = self.inner.registry.get_or_create(&name);
        reporter.start("shellydevice");
        *self.inner.reporter.borrow_mut() = Some(reporter);
    }

    fn subscribed(&self, _sink: &MqttSink, topics: &[ByteString]) {
        let rpc_topic = format!("{}/rpc", self.name());
        if topics.iter().any(|topic| **topic == rpc_topic) {
            self.request_status();
            self.start_status_poll();
        }
    }

    fn received(&self, _sink: &MqttSink, topic: &ByteString, payload: &Bytes) {
        let topic: &str = topic;
        if topic == format!("{}/rpc", GATEWAY_ENDPOINT) {
            match serde_json::from_slice::<RpcResponse>(payload) {
                Ok(response) if response.id == "Shelly.GetStatus" => {
                    self.handle_device_status(response.result.as_ref())
                }
                Ok(response) => {
                    log::trace!("Ignoring RPC response '{}'", response.id)
                }
                Err(err) => {
                    log::warn!("Malformed RPC response from '{}': {}", self.name(), err)
                }
            }
            return;
        }

        let name = self.name();
        let is_component = topic.starts_with(&format!("{}/status/switch:", name))
            || topic.starts_with(&format!("{}/status/light:", name));
        if is_component {
            if let Some(key) = topic.rsplit('/').next() {
                self.handle_component_status(key, payload);
            }
        }
    }

    fn closed(&self) {
        log::info!("Device '{}' session closed", self.name());
        self.inner.poll_epoch.set(self.inner.poll_epoch.get() + 1);
        if let Some(reporter) = self.inner.reporter.borrow_mut().take() {
            reporter.stop();
        }
    }
}
