//! Per-device and per-task acquisition results.

use indexmap::IndexMap;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::store::metaarray::{AxisInfo, ColumnInfo, MetaArray};

/// One recorded (or generated) channel of a [`DeviceResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub units: String,
}

/// Samples from one device: `data` is `channels × samples`, all channels sharing one
/// uniform time axis described by `rate` and `start_time`.
///
/// Unclocked devices report `rate == None` and zero samples; their `settings` still
/// record what was applied.
#[derive(Debug, Clone)]
pub struct DeviceResult {
    pub channels: Vec<ChannelInfo>,
    pub data: Array2<f64>,
    pub rate: Option<f64>,
    /// Epoch seconds of the first sample (the master clock's first tick).
    pub start_time: f64,
    /// Integer divisor of the master rate this device sampled at. Set by the task.
    pub downsample: usize,
    /// Effective settings at start.
    pub settings: Value,
    /// Fewer samples than expected were acquired.
    pub incomplete: bool,
    pub expected_samples: usize,
}

impl DeviceResult {
    pub fn new(channels: Vec<ChannelInfo>, data: Array2<f64>, rate: Option<f64>, start_time: f64) -> Self {
        assert_eq!(
            channels.len(),
            data.nrows(),
            "{} channel descriptors for {} data rows",
            channels.len(),
            data.nrows()
        );
        let expected_samples = data.ncols();
        Self {
            channels,
            data,
            rate,
            start_time,
            downsample: 1,
            settings: Value::Null,
            incomplete: false,
            expected_samples,
        }
    }

    /// Result with no channels and no samples.
    pub fn empty(start_time: f64) -> Self {
        Self::new(Vec::new(), Array2::zeros((0, 0)), None, start_time)
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn channel(&self, name: &str) -> Option<ArrayView1<f64>> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(|i| self.data.row(i))
    }

    pub fn units(&self, name: &str) -> Option<&str> {
        self.channels.iter().find(|c| c.name == name).map(|c| c.units.as_str())
    }

    /// Shortcut for the `primary` channel.
    pub fn primary(&self) -> Option<ArrayView1<f64>> {
        self.channel("primary")
    }

    /// Sample times relative to `start_time`.
    pub fn time_values(&self) -> Array1<f64> {
        match self.rate {
            Some(rate) => Array1::from_shape_fn(self.num_samples(), |i| i as f64 / rate),
            None => Array1::zeros(0),
        }
    }

    /// Converts to a `[Channel, Time]` MetaArray with an implicit time axis.
    pub fn to_metaarray(&self) -> MetaArray {
        let cols = self
            .channels
            .iter()
            .map(|c| ColumnInfo {
                name: c.name.clone(),
                units: Some(c.units.clone()),
            })
            .collect();
        let axes = vec![
            AxisInfo::columns("Channel", cols),
            AxisInfo::uniform("Time", "s", self.rate.unwrap_or(0.), self.start_time),
        ];
        let mut info = Map::new();
        info.insert("settings".into(), self.settings.clone());
        info.insert("downsample".into(), json!(self.downsample));
        info.insert("incomplete".into(), json!(self.incomplete));
        info.insert("expectedSamples".into(), json!(self.expected_samples));
        MetaArray::from_parts(self.data.clone().into_dyn(), axes, info)
            .expect("DeviceResult shape always matches its axis description")
    }

    /// Inverse of [`DeviceResult::to_metaarray`].
    pub fn from_metaarray(ma: &MetaArray) -> Option<Self> {
        if ma.ndim() != 2 {
            return None;
        }
        let data = ma.data.clone().into_dimensionality::<ndarray::Ix2>().ok()?;
        let channels = ma.axes[0]
            .cols
            .iter()
            .map(|c| ChannelInfo {
                name: c.name.clone(),
                units: c.units.clone().unwrap_or_default(),
            })
            .collect();
        let time = &ma.axes[1];
        let rate = time.rate.filter(|r| *r > 0.);
        let mut result = DeviceResult::new(channels, data, rate, time.start_time.unwrap_or(0.));
        result.settings = ma.info.get("settings").cloned().unwrap_or(Value::Null);
        result.downsample = ma.info.get("downsample").and_then(Value::as_u64).unwrap_or(1) as usize;
        result.incomplete = ma.info.get("incomplete").and_then(Value::as_bool).unwrap_or(false);
        result.expected_samples = ma
            .info
            .get("expectedSamples")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(result.num_samples());
        Some(result)
    }

    /// Averages `count` equal-length back-to-back repetitions of every channel.
    /// Trailing samples that do not fill a whole segment are dropped.
    pub fn average_segments(&self, count: usize) -> Array2<f64> {
        let count = count.max(1);
        let seg_len = self.num_samples() / count;
        let mut acc = Array2::<f64>::zeros((self.data.nrows(), seg_len));
        if seg_len == 0 {
            return acc;
        }
        for i in 0..count {
            acc += &self
                .data
                .slice(ndarray::s![.., i * seg_len..(i + 1) * seg_len]);
        }
        acc / count as f64
    }

    /// Mean of `channel` over `range` (sample indices), `None` if empty.
    pub fn mean(&self, channel: &str, range: std::ops::Range<usize>) -> Option<f64> {
        let row = self.channel(channel)?;
        let end = range.end.min(row.len());
        if range.start >= end {
            return None;
        }
        row.slice(ndarray::s![range.start..end]).mean()
    }

    /// Stacks equal-length rows into a `channels × samples` array.
    pub fn stack_rows(rows: &[Array1<f64>]) -> Array2<f64> {
        if rows.is_empty() {
            return Array2::zeros((0, 0));
        }
        let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
        ndarray::stack(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, 0)))
    }
}

/// Final status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Incomplete,
    Aborted,
    Failed,
}

/// The `protocol` entry of a [`TaskResult`].
#[derive(Debug, Clone)]
pub struct ProtocolRecord {
    /// Effective merged parameters (the full description with resolved duration).
    pub params: Value,
    pub start_time: f64,
    pub status: TaskStatus,
}

/// Merged result of one task execution.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub devices: IndexMap<String, DeviceResult>,
    pub protocol: ProtocolRecord,
}

impl TaskResult {
    pub fn get(&self, device: &str) -> Option<&DeviceResult> {
        self.devices.get(device)
    }

    pub fn is_complete(&self) -> bool {
        self.protocol.status == TaskStatus::Completed
    }
}

impl std::ops::Index<&str> for TaskResult {
    type Output = DeviceResult;
    fn index(&self, device: &str) -> &DeviceResult {
        self.devices
            .get(device)
            .unwrap_or_else(|| panic!("No result for device {}", device))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn sample() -> DeviceResult {
        let data = array![[1., 2., 3., 4., 5., 6.], [0., 0., 1., 1., 0., 0.]];
        let channels = vec![
            ChannelInfo {
                name: "primary".into(),
                units: "A".into(),
            },
            ChannelInfo {
                name: "command".into(),
                units: "V".into(),
            },
        ];
        DeviceResult::new(channels, data, Some(1000.), 12.5).with_settings(json!({"mode": "VC"}))
    }

    #[test]
    fn channel_access() {
        let r = sample();
        assert_eq!(r.num_samples(), 6);
        assert_eq!(r.primary().unwrap()[2], 3.);
        assert_eq!(r.units("command"), Some("V"));
        assert!(r.channel("missing").is_none());
        assert_eq!(r.time_values()[3], 0.003);
        assert_eq!(r.mean("primary", 0..2), Some(1.5));
        assert_eq!(r.mean("primary", 4..4), None);
    }

    #[test]
    fn segment_average() {
        let avg = sample().average_segments(2);
        assert_eq!(avg, array![[2.5, 3.5, 4.5], [0.5, 0., 0.5]]);
    }

    #[test]
    fn metaarray_conversion() {
        let mut r = sample();
        r.downsample = 20;
        r.incomplete = true;
        let back = DeviceResult::from_metaarray(&r.to_metaarray()).unwrap();
        assert_eq!(back.data, r.data);
        assert_eq!(back.channel_names(), vec!["primary", "command"]);
        assert_eq!(back.rate, Some(1000.));
        assert_eq!(back.start_time, 12.5);
        assert_eq!(back.downsample, 20);
        assert!(back.incomplete);
        assert_eq!(back.settings, json!({"mode": "VC"}));
    }
}
