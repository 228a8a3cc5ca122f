//! Sample-accurate command waveforms.
//!
//! A [`Waveform`] is edited as a set of non-overlapping [`Segment`]s on a fixed sample grid
//! and rendered into a dense [`Array1`] when a device needs the actual samples. Gaps between
//! segments are padded with the value the previous segment left behind (if it was added
//! with `keep_val`) or with the waveform's baseline.
//!
//! ## Example
//! A test-pulse command at 10 kHz: baseline -65 mV, a 10 ms step of -10 mV after 5 ms.
//! ```
//! use acq_backend::waveform::*;
//!
//! let mut wave = Waveform::new(10e3, -0.065);
//! wave.constant(-0.075, 0.005, 0.010, false).unwrap();
//! let samples = wave.render(200);
//! assert_eq!(samples[0], -0.065);
//! assert_eq!(samples[50], -0.075);
//! assert_eq!(samples[150], -0.065);
//! ```

use ndarray::{s, Array1};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Const(f64),
}

impl Shape {
    /// Overwrites every element of `t_arr` (holding sample times) with the shape's value.
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        match *self {
            Shape::Const(value) => t_arr.fill(value),
        }
    }

    fn value_at(&self, _t: f64) -> f64 {
        match *self {
            Shape::Const(value) => value,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Shape::Const(v) => write!(f, "CONST({})", v),
        }
    }
}

/// A shape bound to the half-open sample interval `start_pos..end_pos`.
/// Ordered by `start_pos` only.
#[derive(Clone, Debug)]
pub struct Segment {
    pub start_pos: usize,
    pub end_pos: usize,
    pub keep_val: bool,
    pub shape: Shape,
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos.cmp(&other.start_pos)
    }
}
impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos
    }
}
impl Eq for Segment {}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({}, {}-{}, {})", self.shape, self.start_pos, self.end_pos, self.keep_val)
    }
}

#[derive(Clone, Debug)]
pub struct Waveform {
    samp_rate: f64,
    baseline: f64,
    segments: BTreeSet<Segment>,
}

impl Waveform {
    pub fn new(samp_rate: f64, baseline: f64) -> Self {
        Self {
            samp_rate,
            baseline,
            segments: BTreeSet::new(),
        }
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Sample index of the end of the last segment, 0 if empty.
    pub fn last_end_pos(&self) -> usize {
        self.segments.iter().map(|s| s.end_pos).max().unwrap_or(0)
    }

    /// Inserts `shape` from time `t` for `duration` seconds. Times are rounded onto the
    /// sample grid. Fails if the interval is empty or overlaps an existing segment.
    pub fn add(&mut self, shape: Shape, t: f64, duration: f64, keep_val: bool) -> Result<()> {
        let start_pos = (t * self.samp_rate).round() as usize;
        let end_pos = start_pos + (duration * self.samp_rate).round() as usize;
        if end_pos <= start_pos {
            return Err(Error::invalid(
                "waveform",
                format!("segment {} has empty interval {}-{}", shape, start_pos, end_pos),
            ));
        }
        let seg = Segment {
            start_pos,
            end_pos,
            keep_val,
            shape,
        };

        if let Some(next) = self.segments.range(&seg..).next() {
            if next.start_pos < seg.end_pos {
                return Err(Error::invalid(
                    "waveform",
                    format!("segment {} overlaps with the next segment {}", seg, next),
                ));
            }
        }
        if let Some(prev) = self.segments.range(..&seg).next_back() {
            if prev.end_pos > seg.start_pos {
                return Err(Error::invalid(
                    "waveform",
                    format!("segment {} overlaps with the previous segment {}", seg, prev),
                ));
            }
        }
        self.segments.insert(seg);
        Ok(())
    }

    pub fn constant(&mut self, value: f64, t: f64, duration: f64, keep_val: bool) -> Result<()> {
        self.add(Shape::Const(value), t, duration, keep_val)
    }

    /// Renders `num_samps` samples starting at sample 0. Segments extending past the end
    /// are truncated.
    pub fn render(&self, num_samps: usize) -> Array1<f64> {
        let mut buffer = Array1::from_elem(num_samps, self.baseline);
        let mut last_val = self.baseline;
        let mut last_end = 0;
        for seg in self.segments.iter() {
            if seg.start_pos >= num_samps {
                break;
            }
            if last_end < seg.start_pos {
                buffer.slice_mut(s![last_end..seg.start_pos]).fill(last_val);
            }
            let end = seg.end_pos.min(num_samps);
            let mut slice = buffer.slice_mut(s![seg.start_pos..end]);
            for (i, v) in slice.iter_mut().enumerate() {
                *v = (seg.start_pos + i) as f64 / self.samp_rate;
            }
            seg.shape.eval_inplace(&mut slice);

            last_val = if seg.keep_val {
                seg.shape.value_at(seg.end_pos as f64 / self.samp_rate)
            } else {
                self.baseline
            };
            last_end = end;
        }
        if last_end < num_samps {
            buffer.slice_mut(s![last_end..]).fill(last_val);
        }
        buffer
    }

    /// Renders one period of `num_samps` samples and repeats it `count` times back-to-back.
    pub fn render_repeated(&self, num_samps: usize, count: usize) -> Array1<f64> {
        let period = self.render(num_samps);
        let mut out = Array1::zeros(num_samps * count);
        for i in 0..count {
            out.slice_mut(s![i * num_samps..(i + 1) * num_samps]).assign(&period);
        }
        out
    }
}
