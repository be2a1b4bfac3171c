//! Health and status reporting.
//!
//! Every long lived part of the gateway (the worker itself and each
//! connected device) owns a [`StatusReporter`]. The registry collects the
//! reporters of one worker and periodically pushes a snapshot of all active
//! entries to the `statusmanager` endpoint.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ntex_util::time::{sleep, Millis};
use ntex_util::HashMap;
use serde::Serialize;
use serde_json::Value;

use crate::ipc::IpcBus;

/// Endpoint receiving the periodic status snapshots
pub const STATUS_ENDPOINT: &str = "statusmanager";

/// Delay between status snapshot pushes
const STATUS_PUSH_DELAY: Millis = Millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Running,
    Instable,
}

struct ReporterInner {
    name: String,
    kind: RefCell<Option<String>>,
    health: Cell<Health>,
    details: RefCell<Option<Value>>,
    active: Cell<bool>,
}

/// Handle through which one component reports its health
pub struct StatusReporter(Rc<ReporterInner>);

impl Clone for StatusReporter {
    fn clone(&self) -> Self {
        StatusReporter(self.0.clone())
    }
}

impl StatusReporter {
    /// Activate the reporter; until [`Self::set_health`] is called the
    /// component shows up as starting.
    pub fn start(&self, kind: &str) {
        *self.0.kind.borrow_mut() = Some(kind.to_string());
        self.0.health.set(Health::Starting);
        self.0.details.replace(None);
        self.0.active.set(true);
    }

    /// Deactivate the reporter, dropping it from future snapshots
    pub fn stop(&self) {
        self.0.active.set(false);
        self.0.details.replace(None);
    }

    pub fn set_health(&self, health: Health) {
        self.0.health.set(health);
    }

    pub fn set_details<T: Serialize>(&self, details: &T) {
        match serde_json::to_value(details) {
            Ok(details) => {
                self.0.details.replace(Some(details));
            }
            Err(err) => log::warn!("Status details of '{}' not serializable: {}", self.0.name, err),
        }
    }

    pub fn clear_details(&self) {
        self.0.details.replace(None);
    }
}

struct RegistryInner {
    entries: RefCell<HashMap<String, Rc<ReporterInner>>>,
    bus: Box<dyn IpcBus>,
}

/// Per worker collection of status reporters
pub struct StatusRegistry {
    inner: Rc<RegistryInner>,
}

impl Clone for StatusRegistry {
    fn clone(&self) -> Self {
        StatusRegistry { inner: self.inner.clone() }
    }
}

impl StatusRegistry {
    pub fn new<B: IpcBus + 'static>(bus: B) -> Self {
        StatusRegistry {
            inner: Rc::new(RegistryInner {
                entries: RefCell::new(HashMap::default()),
                bus: Box::new(bus),
            }),
        }
    }

    /// Reporter for the named component, reusing an existing entry so a
    /// reconnecting device keeps its slot.
    pub fn get_or_create(&self, name: &str) -> StatusReporter {
        let mut entries = self.inner.entries.borrow_mut();
        if let Some(entry) = entries.get(name) {
            return StatusReporter(entry.clone());
        }
        let entry = Rc::new(ReporterInner {
            name: name.to_string(),
            kind: RefCell::new(None),
            health: Cell::new(Health::Starting),
            details: RefCell::new(None),
            active: Cell::new(false),
        });
        entries.insert(name.to_string(), entry.clone());
        StatusReporter(entry)
    }

    /// Snapshot of all active reporters
    pub fn snapshot(&self) -> Value {
        let entries = self.inner.entries.borrow();
        let mut report = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            if !entry.active.get() {
                continue;
            }
            let mut item = serde_json::Map::new();
            item.insert("name".into(), Value::from(entry.name.as_str()));
            if let Some(kind) = entry.kind.borrow().as_deref() {
                item.insert("kind".into(), Value::from(kind));
            }
            if let Ok(health) = serde_json::to_value(entry.health.get()) {
                item.insert("health".into(), health);
            }
            if let Some(details) = entry.details.borrow().as_ref() {
                item.insert("details".into(), details.clone());
            }
            report.push(Value::Object(item));
        }
        Value::Array(report)
    }

    /// Push the current snapshot to the status endpoint
    pub fn push_now(&self) {
        self.inner.bus.indication(STATUS_ENDPOINT, "Status", self.snapshot());
    }

    /// Start the periodic snapshot push; the task stops when the last
    /// registry handle is dropped.
    pub fn spawn_reporting(&self) {
        let weak = Rc::downgrade(&self.inner);
        let _ = ntex_rt::spawn(async move {
            loop {
                sleep(STATUS_PUSH_DELAY).await;
                let Some(inner) = weak.upgrade() else { break };
                StatusRegistry { inner }.push_now();
            }
        });
    }
}
