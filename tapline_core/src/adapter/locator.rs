use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{AdapterIdentifier, AdapterRecord, DeviceEnumerator, DeviceProperties};
use crate::error::{TunnelError, TunnelResult};

/// Hardware id fragments of known TAP driver components.
pub const DEFAULT_COMPONENT_IDS: &[&str] = &["tap0901", "tap0801", "tapoas", "tap-windows"];

/// Description fragments that identify a TAP adapter when hardware ids don't.
pub const DEFAULT_DESCRIPTION_MARKERS: &[&str] = &["TAP-Windows", "TAP-Win32"];

/// Resolves adapter instance identifiers to native device paths.
///
/// Stateless apart from its matching rules: every query enumerates afresh.
#[derive(Clone)]
pub struct AdapterLocator {
    enumerator: Arc<dyn DeviceEnumerator>,
    component_ids: Vec<String>,
    description_markers: Vec<String>,
}

impl fmt::Debug for AdapterLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterLocator")
            .field("component_ids", &self.component_ids)
            .field("description_markers", &self.description_markers)
            .finish_non_exhaustive()
    }
}

impl AdapterLocator {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        AdapterLocator {
            enumerator,
            component_ids: lowercase_all(DEFAULT_COMPONENT_IDS.iter().copied()),
            description_markers: lowercase_all(DEFAULT_DESCRIPTION_MARKERS.iter().copied()),
        }
    }

    /// Replace the candidate markers. Empty lists keep the defaults.
    pub fn with_markers(mut self, component_ids: Vec<String>, description_markers: Vec<String>) -> Self {
        if !component_ids.is_empty() {
            self.component_ids = lowercase_all(component_ids.iter().map(String::as_str));
        }
        if !description_markers.is_empty() {
            self.description_markers = lowercase_all(description_markers.iter().map(String::as_str));
        }
        self
    }

    /// Every present device that looks like a virtual adapter.
    pub fn list_adapters(&self) -> TunnelResult<Vec<AdapterRecord>> {
        let devices = self.enumerator.network_devices().map_err(|e| match e {
            TunnelError::Discovery(_) => e,
            other => TunnelError::Discovery(other.to_string()),
        })?;
        debug!(count = devices.len(), "Enumerated network-class devices");

        Ok(devices
            .iter()
            .filter_map(|device| self.candidate(device))
            .collect())
    }

    /// The candidate adapter whose instance id equals `identifier`.
    pub fn find_adapter(&self, identifier: &AdapterIdentifier) -> TunnelResult<Option<AdapterRecord>> {
        Ok(self
            .list_adapters()?
            .into_iter()
            .find(|record| record.instance_id == *identifier))
    }

    /// Native device path of the adapter with `identifier`, if present.
    pub fn find_device_path(&self, identifier: &AdapterIdentifier) -> TunnelResult<Option<String>> {
        Ok(self
            .find_adapter(identifier)?
            .map(|record| record.device_path))
    }

    fn candidate(&self, device: &DeviceProperties) -> Option<AdapterRecord> {
        let component_id = device
            .hardware_ids
            .iter()
            .find(|hwid| {
                let hwid = hwid.to_lowercase();
                self.component_ids.iter().any(|tag| hwid.contains(tag.as_str()))
            })
            .cloned();

        let description = device.description.clone().unwrap_or_default();
        let described = {
            let lowered = description.to_lowercase();
            self.description_markers
                .iter()
                .any(|marker| lowered.contains(marker.as_str()))
        };

        if component_id.is_none() && !described {
            return None;
        }

        let raw_id = device.instance_id.as_deref()?;
        let instance_id = match AdapterIdentifier::parse(raw_id) {
            Ok(id) => id,
            Err(_) => {
                trace!(instance_id = raw_id, "Skipping candidate with malformed instance id");
                return None;
            }
        };

        Some(AdapterRecord {
            device_path: self.enumerator.device_path(&instance_id),
            instance_id,
            component_id: component_id
                .or_else(|| device.hardware_ids.first().cloned())
                .unwrap_or_default(),
            description,
        })
    }
}

fn lowercase_all<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items.map(str::to_lowercase).collect()
}
