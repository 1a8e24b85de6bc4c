use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// A radio selected for the run. Immutable once discovery returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub port: String,
    pub index: usize,
}

impl Device {
    pub fn new(prefix: &str, port: String, index: usize) -> Self {
        Self {
            name: format!("{}-{}", prefix, index + 1),
            port,
            index,
        }
    }
}

/// A single line captured from a device's serial endpoint.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    /// Decoded, trimmed line as the firmware printed it
    pub raw_line: String,
}

impl LogEvent {
    pub fn new(device_name: String, raw_line: String) -> Self {
        Self {
            device_name,
            timestamp: Utc::now(),
            raw_line,
        }
    }
}

/// Events for one device in arrival order.
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    events: Vec<LogEvent>,
}

impl DeviceLog {
    pub fn push(&mut self, event: LogEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl FromIterator<LogEvent> for DeviceLog {
    fn from_iter<I: IntoIterator<Item = LogEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

/// Per-device logs keyed by device name.
pub type DeviceLogs = BTreeMap<String, DeviceLog>;
