use crate::error::HarnessError;
use crate::types::Device;
use log::{info, warn};
use tokio_serial::SerialPortType;

pub const REQUIRED_DEVICES: usize = 2;

/// A serial endpoint as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub description: String,
}

/// Source of serial endpoints, in enumeration order.
pub trait PortEnumerator {
    fn endpoints(&self) -> Result<Vec<Endpoint>, HarnessError>;
}

/// Enumerates the ports the operating system currently exposes.
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn endpoints(&self) -> Result<Vec<Endpoint>, HarnessError> {
        Ok(tokio_serial::available_ports()?
            .into_iter()
            .map(|port| Endpoint {
                description: describe(&port.port_type),
                address: port.port_name,
            })
            .collect())
    }
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            match (usb.product.as_deref(), usb.manufacturer.as_deref()) {
                (Some(product), Some(manufacturer)) => format!("{} - {}", product, manufacturer),
                (Some(text), None) | (None, Some(text)) => text.to_string(),
                (None, None) => "USB Serial".to_string(),
            }
        }
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

/// Endpoints whose description contains any keyword, ignoring case.
pub fn candidates(endpoints: Vec<Endpoint>, keywords: &[String]) -> Vec<Endpoint> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    endpoints
        .into_iter()
        .filter(|endpoint| {
            let description = endpoint.description.to_lowercase();
            keywords.iter().any(|k| description.contains(k.as_str()))
        })
        .collect()
}

/// Picks the first two matching endpoints in enumeration order.
///
/// Two descriptive entries are assumed to be two physical radios; a single
/// board exposing two matching ports would be selected twice.
pub fn discover(
    enumerator: &dyn PortEnumerator,
    keywords: &[String],
    prefix: &str,
) -> Result<Vec<Device>, HarnessError> {
    info!("Scanning for T-Deck devices...");

    let found = candidates(enumerator.endpoints()?, keywords);
    for endpoint in &found {
        info!("Found potential T-Deck: {} - {}", endpoint.address, endpoint.description);
    }

    if found.len() < REQUIRED_DEVICES {
        warn!("Make sure both T-Decks are connected and in flashing mode");
        return Err(HarnessError::InsufficientDevices {
            found: found.len(),
            required: REQUIRED_DEVICES,
        });
    }

    let devices: Vec<Device> = found
        .into_iter()
        .take(REQUIRED_DEVICES)
        .enumerate()
        .map(|(index, endpoint)| Device::new(prefix, endpoint.address, index))
        .collect();

    info!(
        "Selected T-Deck devices: {:?}",
        devices.iter().map(|d| d.port.as_str()).collect::<Vec<_>>()
    );
    Ok(devices)
}
