//! N-dimensional arrays with per-axis metadata, and their on-disk format.
//!
//! ## File layout
//! ```text
//! MetaArray 1\n
//! {"shape":[...],"axes":[...],"info":{...}}\n
//! <f64 little-endian samples in C order>
//! ```
//! Every axis carries a `name`, optional `units`, and at most one of: explicit `values`,
//! an implicit uniform scale (`rate` + `startTime`), or column descriptors `cols`.

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const MAGIC: &[u8] = b"MetaArray 1\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cols: Vec<ColumnInfo>,
}

impl AxisInfo {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// Axis with an implicit uniform scale.
    pub fn uniform(name: &str, units: &str, rate: f64, start_time: f64) -> Self {
        Self {
            name: Some(name.to_string()),
            units: Some(units.to_string()),
            rate: Some(rate),
            start_time: Some(start_time),
            ..Default::default()
        }
    }

    /// Axis with an explicit value per index.
    pub fn explicit(name: &str, units: &str, values: Vec<f64>) -> Self {
        Self {
            name: Some(name.to_string()),
            units: Some(units.to_string()),
            values: Some(values),
            ..Default::default()
        }
    }

    /// Axis whose indices are named columns.
    pub fn columns(name: &str, cols: Vec<ColumnInfo>) -> Self {
        Self {
            name: Some(name.to_string()),
            cols,
            ..Default::default()
        }
    }

    /// Metadata that must agree between two arrays along an axis that is *not* being
    /// appended.
    fn same_schema(&self, other: &AxisInfo) -> bool {
        self == other
    }

    /// Metadata that must agree along the append axis (extent-dependent parts excluded).
    fn same_append_schema(&self, other: &AxisInfo) -> bool {
        self.name == other.name
            && self.units == other.units
            && self.rate == other.rate
            && self.values.is_some() == other.values.is_some()
            && self.cols.is_empty() == other.cols.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaArray {
    pub data: ArrayD<f64>,
    pub axes: Vec<AxisInfo>,
    pub info: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    shape: Vec<usize>,
    axes: Vec<AxisInfo>,
    #[serde(default)]
    info: Map<String, Value>,
}

impl MetaArray {
    /// Builds an array, checking that `axes` describes every dimension consistently.
    pub fn from_parts(data: ArrayD<f64>, axes: Vec<AxisInfo>, info: Map<String, Value>) -> std::result::Result<Self, String> {
        if axes.len() != data.ndim() {
            return Err(format!("{} axis descriptors for a rank-{} array", axes.len(), data.ndim()));
        }
        for (i, axis) in axes.iter().enumerate() {
            let extent = data.shape()[i];
            if let Some(values) = &axis.values {
                if values.len() != extent {
                    return Err(format!("axis {} has {} values for extent {}", i, values.len(), extent));
                }
            }
            if !axis.cols.is_empty() && axis.cols.len() != extent {
                return Err(format!("axis {} has {} columns for extent {}", i, axis.cols.len(), extent));
            }
        }
        Ok(Self { data, axes, info })
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name.as_deref() == Some(name))
    }

    /// Checks that `other` can be appended along `axis` and returns the axis index.
    pub fn check_appendable(&self, other: &MetaArray, axis: &str) -> std::result::Result<usize, String> {
        let idx = self
            .axis_index(axis)
            .ok_or_else(|| format!("existing array has no axis '{}'", axis))?;
        if other.axis_index(axis) != Some(idx) {
            return Err(format!("new data does not have axis '{}' at position {}", axis, idx));
        }
        if self.ndim() != other.ndim() {
            return Err(format!("rank {} cannot accept rank {}", self.ndim(), other.ndim()));
        }
        for i in 0..self.ndim() {
            if i == idx {
                if !self.axes[i].same_append_schema(&other.axes[i]) {
                    return Err(format!("metadata of append axis '{}' differs", axis));
                }
                continue;
            }
            if self.shape()[i] != other.shape()[i] {
                return Err(format!(
                    "axis {} extent {} differs from {}",
                    i,
                    self.shape()[i],
                    other.shape()[i]
                ));
            }
            if !self.axes[i].same_schema(&other.axes[i]) {
                return Err(format!("metadata of axis {} differs", i));
            }
        }
        Ok(idx)
    }

    /// Concatenates `other` along `axis`. Existing samples are kept unchanged and the
    /// array is left untouched on failure.
    pub fn append(&mut self, other: &MetaArray, axis: &str) -> std::result::Result<(), String> {
        let idx = self.check_appendable(other, axis)?;
        let joined = ndarray::concatenate(Axis(idx), &[self.data.view(), other.data.view()])
            .map_err(|e| e.to_string())?;
        if let (Some(values), Some(more)) = (&mut self.axes[idx].values, &other.axes[idx].values) {
            values.extend_from_slice(more);
        }
        if !other.axes[idx].cols.is_empty() {
            self.axes[idx].cols.extend(other.axes[idx].cols.iter().cloned());
        }
        self.data = joined;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = Header {
            shape: self.shape().to_vec(),
            axes: self.axes.clone(),
            info: self.info.clone(),
        };
        let mut out = Vec::with_capacity(MAGIC.len() + self.data.len() * 8 + 256);
        out.extend_from_slice(MAGIC);
        serde_json::to_writer(&mut out, &header)?;
        out.push(b'\n');
        for v in self.data.iter() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt MetaArray: {}", reason),
            ))
        };
        let rest = bytes.strip_prefix(MAGIC).ok_or_else(|| corrupt("bad magic"))?;
        let nl = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing header"))?;
        let header: Header = serde_json::from_slice(&rest[..nl])?;
        let payload = &rest[nl + 1..];
        let count: usize = header.shape.iter().product();
        if payload.len() != count * 8 {
            return Err(corrupt("payload length does not match shape"));
        }
        let samples: Vec<f64> = payload
            .chunks_exact(8)
            .map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                f64::from_le_bytes(buf)
            })
            .collect();
        let data = ArrayD::from_shape_vec(IxDyn(&header.shape), samples).map_err(|e| corrupt(&e.to_string()))?;
        MetaArray::from_parts(data, header.axes, header.info).map_err(|e| corrupt(&e))
    }
}
