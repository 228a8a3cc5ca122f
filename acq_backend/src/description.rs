//! Declarative task descriptions.
//!
//! A description is a mapping from string key to parameter block. The reserved key
//! `protocol` carries the task-wide [`ProtocolParams`]; every other key names a device and
//! maps to that device's own parameter block, which is validated by the device itself.
//!
//! ```
//! use acq_backend::description::TaskDescription;
//! use serde_json::json;
//!
//! let desc = TaskDescription::from_value(json!({
//!     "protocol": {"duration": 0.5, "name": "sweep"},
//!     "daq": {"rate": 20000.0},
//!     "clamp_A": {"mode": "VC", "daq": "daq"},
//! })).unwrap();
//! assert_eq!(desc.protocol.duration, 0.5);
//! assert_eq!(desc.device_names(), vec!["daq", "clamp_A"]);
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::MAX_SECS;
use crate::error::{Error, Result};

/// Reserved key of the task-wide block.
pub const PROTOCOL_KEY: &str = "protocol";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Single,
    Sequence,
}

/// Task-wide parameters found under the `protocol` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Seconds of acquisition.
    pub duration: f64,
    /// Pre-roll in seconds between the start call and the master clock's first tick.
    #[serde(rename = "leadTime", default)]
    pub lead_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "storeData", default)]
    pub store_data: bool,
    #[serde(default)]
    pub mode: ProtocolMode,
    /// Extra seconds allowed past `duration + leadTime` before timing out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_margin: Option<f64>,
    /// Turns a short acquisition into an error instead of an incomplete result.
    #[serde(default)]
    pub strict: bool,
}

impl ProtocolParams {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            lead_time: 0.,
            name: None,
            store_data: false,
            mode: ProtocolMode::Single,
            timeout_margin: None,
            strict: false,
        }
    }

    /// Every span must be finite, non-negative and at most [`MAX_SECS`].
    pub fn validate(&self) -> Result<()> {
        let spans = [
            ("duration", Some(self.duration)),
            ("leadTime", Some(self.lead_time)),
            ("timeout_margin", self.timeout_margin),
        ];
        for (key, value) in spans {
            if let Some(v) = value {
                if !(0. ..=MAX_SECS).contains(&v) {
                    return Err(Error::invalid(
                        PROTOCOL_KEY,
                        format!("{} {} must be between 0 and {} s", key, v, MAX_SECS),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescription {
    pub protocol: ProtocolParams,
    /// Device name → device-specific parameter block, in description order.
    pub devices: IndexMap<String, Value>,
}

impl TaskDescription {
    pub fn new(duration: f64) -> Self {
        Self {
            protocol: ProtocolParams::new(duration),
            devices: IndexMap::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.protocol.name = Some(name.to_string());
        self
    }

    pub fn with_device(mut self, name: &str, params: Value) -> Self {
        self.devices.insert(name.to_string(), params);
        self
    }

    pub fn name(&self) -> &str {
        self.protocol.name.as_deref().unwrap_or("task")
    }

    pub fn device_names(&self) -> Vec<&str> {
        self.devices.keys().map(|k| k.as_str()).collect()
    }

    /// Parses a description mapping. Fails [`Error::InvalidParams`] when the top level is
    /// not a mapping, the `protocol` block is missing or malformed, or a span is out of
    /// range (see [`ProtocolParams::validate`]).
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::invalid(PROTOCOL_KEY, "task description must be a mapping"));
        };
        let protocol = map
            .shift_remove(PROTOCOL_KEY)
            .ok_or_else(|| Error::invalid(PROTOCOL_KEY, "missing 'protocol' block"))?;
        let protocol: ProtocolParams =
            serde_json::from_value(protocol).map_err(|e| Error::invalid(PROTOCOL_KEY, e.to_string()))?;
        protocol.validate()?;
        Ok(Self {
            protocol,
            devices: map.into_iter().collect(),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Serializes back into the mapping form, `protocol` first.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            PROTOCOL_KEY.to_string(),
            serde_json::to_value(&self.protocol).unwrap_or(Value::Null),
        );
        for (name, params) in self.devices.iter() {
            map.insert(name.clone(), params.clone());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let desc = TaskDescription::from_value(json!({"protocol": {"duration": 1.0}})).unwrap();
        assert_eq!(desc.protocol.lead_time, 0.);
        assert!(!desc.protocol.store_data);
        assert_eq!(desc.protocol.mode, ProtocolMode::Single);
        assert_eq!(desc.name(), "task");
        assert!(desc.devices.is_empty());
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            json!([1, 2]),
            json!({"daq": {}}),
            json!({"protocol": {"leadTime": 1.0}}),
            json!({"protocol": {"duration": -1.0}}),
            json!({"protocol": {"duration": 1e20}}),
            json!({"protocol": {"duration": 1.0, "leadTime": 1e20}}),
            json!({"protocol": {"duration": 1.0, "timeout_margin": -2.0}}),
            json!({"protocol": {"duration": 1.0, "mode": "loop"}}),
        ] {
            let err = TaskDescription::from_value(bad).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
        }
    }

    #[test]
    fn value_round_trip_keeps_order() {
        let desc = TaskDescription::new(0.2)
            .with_name("tp")
            .with_device("zeta", json!({"a": 1}))
            .with_device("alpha", json!({"b": 2}));
        let value = desc.to_value();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["protocol", "zeta", "alpha"]);
        assert_eq!(TaskDescription::from_value(value).unwrap(), desc);
    }
}
