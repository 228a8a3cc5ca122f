//! # Simulated hardware
//!
//! Stand-ins for the real device drivers, sufficient to run complete tasks without a rig:
//!
//! - [`SimDaq`]: acquisition board and clock master. Records optional constant-level
//!   analog inputs at `rate / downsample`.
//! - [`SimClamp`]: patch-clamp amplifier slaved to its DAQ. Plays a command waveform into
//!   a single-compartment cell ([`CellModel`]) and records the response.
//! - [`SimShutter`]: unclocked safety device; [`Device::abort`] closes it.
//!
//! Every simulated acquisition runs in real time: a task is done once `duration` has
//! elapsed since the start trigger. Stopping early keeps the samples "acquired" so far
//! and marks the result incomplete.
//!
//! [`SimDaq`] and [`SimClamp`] support failure injection (`fail_on_start`,
//! `fail_on_poll`) for exercising the task's error paths.

use indexmap::IndexMap;
use ndarray::{s, Array1};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use acq_backend::clock::{self, secs};
use acq_backend::error::{Error, Result};
use acq_backend::{
    parse_params, ChannelInfo, ClampDevice, ClampMode, ClockInfo, ClockRole, ConfigureContext, Device, DeviceCore,
    DeviceResult, DeviceTask, Requirements, StartTrigger,
};

/// Largest command buffer a simulated amplifier will allocate.
const MAX_SAMPLES: usize = 1 << 28;

fn samples(duration: f64, rate: f64) -> usize {
    (duration * rate).round().max(0.) as usize
}

/// Switchable simulated failures, copied into each configured task.
#[derive(Default)]
struct FailureInjection {
    on_start: AtomicBool,
    on_poll: AtomicBool,
}

impl FailureInjection {
    fn snapshot(&self) -> (bool, bool) {
        (self.on_start.load(Ordering::SeqCst), self.on_poll.load(Ordering::SeqCst))
    }
}

/// Start/stop bookkeeping shared by the simulated tasks.
struct Timeline {
    duration: f64,
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl Timeline {
    fn new(duration: f64) -> Self {
        Self {
            duration,
            started: None,
            stopped: None,
        }
    }

    fn start(&mut self, at: Instant) {
        self.started = Some(at);
    }

    fn end(&self) -> Option<Instant> {
        self.started.map(|s| s + secs(self.duration))
    }

    fn is_done(&self) -> bool {
        self.stopped.is_some() || self.end().map_or(false, |end| Instant::now() >= end)
    }

    fn stop(&mut self) {
        if self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
    }

    /// Samples out of `expected` acquired by now.
    fn acquired(&self, expected: usize) -> usize {
        let (Some(start), Some(end)) = (self.started, self.end()) else {
            return 0;
        };
        let until = self.stopped.unwrap_or_else(Instant::now);
        if until >= end {
            return expected;
        }
        let elapsed = until.saturating_duration_since(start).as_secs_f64();
        ((elapsed / self.duration * expected as f64).floor() as usize).min(expected)
    }

    fn start_epoch(&self) -> f64 {
        self.started.map(clock::to_epoch).unwrap_or_else(clock::now)
    }
}

fn block_means(samples: &Array1<f64>, factor: usize, blocks: usize) -> Array1<f64> {
    Array1::from_shape_fn(blocks, |b| {
        samples
            .slice(s![b * factor..(b + 1) * factor])
            .mean()
            .unwrap_or(0.)
    })
}

// DAQ ----------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DaqParams {
    rate: Option<f64>,
    #[serde(default = "one")]
    downsample: usize,
    /// Analog inputs to record.
    #[serde(default)]
    ai: Vec<String>,
}

fn one() -> usize {
    1
}

/// Acquisition board and sample-clock master.
pub struct SimDaq {
    core: DeviceCore,
    default_rate: f64,
    inputs: IndexMap<String, f64>,
    fail: FailureInjection,
}

impl SimDaq {
    pub fn new(name: &str, default_rate: f64) -> Self {
        Self {
            core: DeviceCore::new(name),
            default_rate,
            inputs: IndexMap::new(),
            fail: FailureInjection::default(),
        }
    }

    /// Adds an analog input that reads a constant `level` (volts).
    pub fn with_input(mut self, channel: &str, level: f64) -> Self {
        self.inputs.insert(channel.to_string(), level);
        self
    }

    pub fn fail_on_start(&self, fail: bool) {
        self.fail.on_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_on_poll(&self, fail: bool) {
        self.fail.on_poll.store(fail, Ordering::SeqCst);
    }

    fn params(&self, params: &Value) -> Result<DaqParams> {
        let p: DaqParams = parse_params(self.name(), params)?;
        let rate = p.rate.unwrap_or(self.default_rate);
        if !(rate.is_finite() && rate > 0.) {
            return Err(Error::invalid(self.name(), format!("invalid rate {}", rate)));
        }
        if p.downsample == 0 {
            return Err(Error::invalid(self.name(), "downsample must be at least 1"));
        }
        if let Some(unknown) = p.ai.iter().find(|c| !self.inputs.contains_key(*c)) {
            return Err(Error::invalid(self.name(), format!("no analog input '{}'", unknown)));
        }
        Ok(p)
    }
}

impl Device for SimDaq {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn requirements(&self, params: &Value) -> Result<Requirements> {
        let p = self.params(params)?;
        Ok(Requirements {
            depends_on: Vec::new(),
            clock: ClockRole::Master {
                rate: p.rate.unwrap_or(self.default_rate),
            },
            min_duration: 0.,
        })
    }

    fn configure(&self, params: &Value, ctx: &ConfigureContext) -> Result<Box<dyn DeviceTask>> {
        let p = self.params(params)?;
        let rate = p.rate.unwrap_or(self.default_rate);
        let (fail_on_start, fail_on_poll) = self.fail.snapshot();
        let channels = p
            .ai
            .iter()
            .map(|c| (c.clone(), self.inputs[c.as_str()]))
            .collect();
        tracing::debug!(device = %self.name(), rate, downsample = p.downsample, "configured DAQ");
        Ok(Box::new(SimDaqTask {
            name: self.name().to_string(),
            clock: ClockInfo {
                rate,
                downsample: p.downsample,
            },
            channels,
            timeline: Timeline::new(ctx.duration),
            fail_on_start,
            fail_on_poll,
        }))
    }

    fn list_channels(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }

    fn get_param(&self, name: &str) -> Option<Value> {
        match name {
            "rate" => Some(json!(self.default_rate)),
            _ => None,
        }
    }
}

struct SimDaqTask {
    name: String,
    clock: ClockInfo,
    channels: Vec<(String, f64)>,
    timeline: Timeline,
    fail_on_start: bool,
    fail_on_poll: bool,
}

impl DeviceTask for SimDaqTask {
    fn start(&mut self, trigger: &StartTrigger) -> Result<()> {
        if self.fail_on_start {
            return Err(Error::device_failure(&self.name, "simulated start failure"));
        }
        let at = trigger.fire(trigger.scheduled());
        self.timeline.start(at);
        Ok(())
    }

    fn is_done(&mut self) -> Result<bool> {
        if self.fail_on_poll {
            return Err(Error::device_failure(&self.name, "simulated read failure"));
        }
        Ok(self.timeline.is_done())
    }

    fn stop(&mut self, _abort: bool) -> Result<()> {
        self.timeline.stop();
        Ok(())
    }

    fn result(self: Box<Self>) -> Result<DeviceResult> {
        let rate = self.clock.rate / self.clock.downsample as f64;
        let expected = samples(self.timeline.duration, rate);
        let acquired = self.timeline.acquired(expected);
        let channels = self
            .channels
            .iter()
            .map(|(name, _)| ChannelInfo {
                name: name.clone(),
                units: "V".to_string(),
            })
            .collect();
        let rows: Vec<Array1<f64>> = self
            .channels
            .iter()
            .map(|(_, level)| Array1::from_elem(acquired, *level))
            .collect();
        let data = if rows.is_empty() {
            ndarray::Array2::zeros((0, acquired))
        } else {
            DeviceResult::stack_rows(&rows)
        };
        let mut result = DeviceResult::new(channels, data, Some(rate), self.timeline.start_epoch()).with_settings(json!({
            "rate": self.clock.rate,
            "downsample": self.clock.downsample,
            "ai": self.channels.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
        }));
        result.expected_samples = expected;
        result.incomplete = acquired < expected;
        Ok(result)
    }

    fn clock_info(&self) -> Option<ClockInfo> {
        Some(self.clock)
    }
}

// Clamp --------------------------------------------------------------------

/// Single-compartment cell behind an access resistance.
///
/// ```text
///   pipette ──Ra──┬──────────┐
///                 Rin        Cm
///                 │(Vrest)   │
///   ground ───────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellModel {
    pub access_resistance: f64,
    pub input_resistance: f64,
    pub capacitance: f64,
    pub resting_potential: f64,
}

impl Default for CellModel {
    fn default() -> Self {
        Self {
            access_resistance: 10e6,
            input_resistance: 200e6,
            capacitance: 10e-12,
            resting_potential: -0.065,
        }
    }
}

impl CellModel {
    /// Recorded response to `command` sampled every `dt` seconds, starting from the steady
    /// state of the first command value. VC records pipette current, IC / I=0 record
    /// pipette potential (membrane potential plus the access-resistance drop).
    ///
    /// Each step is integrated exactly for a command held constant over the step.
    pub fn respond(&self, mode: ClampMode, command: &Array1<f64>, dt: f64) -> Array1<f64> {
        let ra = self.access_resistance;
        let rin = self.input_resistance;
        let vrest = self.resting_potential;
        let mut out = Array1::zeros(command.len());
        let Some(first) = command.first().copied() else {
            return out;
        };
        match mode {
            ClampMode::VC => {
                let g = 1. / ra + 1. / rin;
                let decay = (-dt * g / self.capacitance).exp();
                let v_inf = |c: f64| (c / ra + vrest / rin) / g;
                let mut vm = v_inf(first);
                for (k, c) in command.iter().enumerate() {
                    out[k] = (c - vm) / ra;
                    let target = v_inf(*c);
                    vm = target + (vm - target) * decay;
                }
            }
            ClampMode::IC | ClampMode::I0 => {
                let decay = (-dt / (rin * self.capacitance)).exp();
                let mut vm = vrest + first * rin;
                for (k, i) in command.iter().enumerate() {
                    out[k] = vm + i * ra;
                    let target = vrest + i * rin;
                    vm = target + (vm - target) * decay;
                }
            }
        }
        out
    }
}

struct ClampState {
    mode: ClampMode,
    vc_holding: f64,
    ic_holding: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClampParams {
    mode: Option<ClampMode>,
    holding: Option<f64>,
    /// Absolute command samples at the master rate; padded with the holding level.
    command: Option<Vec<f64>>,
    daq: Option<String>,
}

/// Patch-clamp amplifier channel wired to the DAQ `daq`.
pub struct SimClamp {
    core: DeviceCore,
    daq: String,
    model: Mutex<CellModel>,
    state: Mutex<ClampState>,
    fail: FailureInjection,
}

impl SimClamp {
    pub fn new(name: &str, daq: &str, model: CellModel) -> Self {
        Self {
            core: DeviceCore::new(name),
            daq: daq.to_string(),
            model: Mutex::new(model),
            state: Mutex::new(ClampState {
                mode: ClampMode::VC,
                vc_holding: -0.065,
                ic_holding: 0.,
            }),
            fail: FailureInjection::default(),
        }
    }

    pub fn set_model(&self, model: CellModel) {
        *self.model.lock() = model;
    }

    pub fn model(&self) -> CellModel {
        *self.model.lock()
    }

    pub fn fail_on_start(&self, fail: bool) {
        self.fail.on_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_on_poll(&self, fail: bool) {
        self.fail.on_poll.store(fail, Ordering::SeqCst);
    }

    fn params(&self, params: &Value) -> Result<ClampParams> {
        let p: ClampParams = parse_params(self.name(), params)?;
        if let Some(daq) = &p.daq {
            if daq != &self.daq {
                return Err(Error::invalid(
                    self.name(),
                    format!("wired to DAQ '{}', not '{}'", self.daq, daq),
                ));
            }
        }
        if let Some(cmd) = &p.command {
            if cmd.iter().any(|v| !v.is_finite()) {
                return Err(Error::invalid(self.name(), "command contains non-finite samples"));
            }
        }
        Ok(p)
    }
}

impl ClampDevice for SimClamp {
    fn mode(&self) -> ClampMode {
        self.state.lock().mode
    }

    fn set_mode(&self, mode: ClampMode) -> Result<()> {
        let mut st = self.state.lock();
        if st.mode != mode {
            tracing::debug!(device = %self.name(), from = %st.mode, to = %mode, "clamp mode");
            st.mode = mode;
        }
        Ok(())
    }

    fn holding(&self, mode: ClampMode) -> f64 {
        let st = self.state.lock();
        match mode {
            ClampMode::VC => st.vc_holding,
            ClampMode::IC => st.ic_holding,
            ClampMode::I0 => 0.,
        }
    }

    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::invalid(self.name(), format!("invalid holding {}", value)));
        }
        let mut st = self.state.lock();
        match mode {
            ClampMode::VC => st.vc_holding = value,
            ClampMode::IC => st.ic_holding = value,
            ClampMode::I0 => return Err(Error::invalid(self.name(), "I=0 has no holding level")),
        }
        Ok(())
    }

    fn daq_name(&self) -> &str {
        &self.daq
    }
}

impl Device for SimClamp {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn requirements(&self, params: &Value) -> Result<Requirements> {
        self.params(params)?;
        Ok(Requirements {
            depends_on: vec![self.daq.clone()],
            clock: ClockRole::Slave {
                master: self.daq.clone(),
            },
            min_duration: 0.,
        })
    }

    fn configure(&self, params: &Value, ctx: &ConfigureContext) -> Result<Box<dyn DeviceTask>> {
        let p = self.params(params)?;
        if let Some(mode) = p.mode {
            self.set_mode(mode)?;
        }
        let mode = self.mode();
        if let Some(holding) = p.holding {
            self.set_holding(mode, holding)?;
        }
        let holding = self.holding(mode);
        let clock = ctx.clock(&self.daq).ok_or_else(|| {
            Error::invalid(self.name(), format!("DAQ '{}' has not published a clock", self.daq))
        })?;

        let n = samples(ctx.duration, clock.rate);
        if n > MAX_SAMPLES {
            return Err(Error::invalid(
                self.name(),
                format!("{} s at {} Hz exceeds the simulated buffer", ctx.duration, clock.rate),
            ));
        }
        let mut command = Array1::from_elem(n, holding);
        if mode != ClampMode::I0 {
            if let Some(given) = &p.command {
                let len = given.len().min(n);
                command
                    .slice_mut(s![..len])
                    .assign(&Array1::from(given[..len].to_vec()));
            }
        }
        let (fail_on_start, fail_on_poll) = self.fail.snapshot();
        Ok(Box::new(SimClampTask {
            name: self.name().to_string(),
            mode,
            holding,
            daq: self.daq.clone(),
            model: self.model(),
            command,
            clock,
            trigger_timeout: ctx.lead_time + 1.,
            timeline: Timeline::new(ctx.duration),
            fail_on_start,
            fail_on_poll,
        }))
    }

    fn list_channels(&self) -> Vec<String> {
        vec!["primary".to_string(), "command".to_string()]
    }

    fn get_param(&self, name: &str) -> Option<Value> {
        match name {
            "mode" => serde_json::to_value(self.mode()).ok(),
            "holding" => Some(json!(self.holding(self.mode()))),
            _ => None,
        }
    }

    fn set_param(&self, name: &str, value: Value) -> Result<()> {
        match name {
            "mode" => self.set_mode(parse_params(self.name(), &value)?),
            "holding" => {
                let v: f64 = parse_params(self.name(), &value)?;
                self.set_holding(self.mode(), v)
            }
            _ => Err(Error::invalid(self.name(), format!("no settable parameter '{}'", name))),
        }
    }

    fn as_clamp(&self) -> Option<&dyn ClampDevice> {
        Some(self)
    }
}

struct SimClampTask {
    name: String,
    mode: ClampMode,
    holding: f64,
    daq: String,
    model: CellModel,
    command: Array1<f64>,
    clock: ClockInfo,
    trigger_timeout: f64,
    timeline: Timeline,
    fail_on_start: bool,
    fail_on_poll: bool,
}

impl DeviceTask for SimClampTask {
    fn start(&mut self, trigger: &StartTrigger) -> Result<()> {
        if self.fail_on_start {
            return Err(Error::device_failure(&self.name, "simulated start failure"));
        }
        let at = trigger
            .wait(secs(self.trigger_timeout))
            .ok_or_else(|| Error::device_failure(&self.name, "start trigger never fired"))?;
        self.timeline.start(at);
        Ok(())
    }

    fn is_done(&mut self) -> Result<bool> {
        if self.fail_on_poll {
            return Err(Error::device_failure(&self.name, "simulated amplifier failure"));
        }
        Ok(self.timeline.is_done())
    }

    fn stop(&mut self, _abort: bool) -> Result<()> {
        self.timeline.stop();
        Ok(())
    }

    fn result(self: Box<Self>) -> Result<DeviceResult> {
        let ds = self.clock.downsample;
        let expected = self.command.len() / ds;
        let acquired = self.timeline.acquired(self.command.len()) / ds;
        let response = self.model.respond(self.mode, &self.command, 1. / self.clock.rate);
        let data = DeviceResult::stack_rows(&[
            block_means(&response, ds, acquired),
            block_means(&self.command, ds, acquired),
        ]);
        let channels = vec![
            ChannelInfo {
                name: "primary".to_string(),
                units: self.mode.primary_units().to_string(),
            },
            ChannelInfo {
                name: "command".to_string(),
                units: self.mode.command_units().to_string(),
            },
        ];
        let mut result = DeviceResult::new(
            channels,
            data,
            Some(self.clock.rate / ds as f64),
            self.timeline.start_epoch(),
        )
        .with_settings(json!({
            "mode": self.mode,
            "holding": self.holding,
            "daq": self.daq,
        }));
        result.expected_samples = expected;
        result.incomplete = acquired < expected;
        Ok(result)
    }
}

// Shutter ------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ShutterParams {
    open: bool,
    /// Shortest time the shutter must stay open, in seconds.
    hold: f64,
}

impl Default for ShutterParams {
    fn default() -> Self {
        Self { open: true, hold: 0. }
    }
}

/// Light-path shutter. Closed is its safe state.
pub struct SimShutter {
    core: DeviceCore,
    open: Arc<AtomicBool>,
    aborts: AtomicUsize,
}

impl SimShutter {
    pub fn new(name: &str) -> Self {
        Self {
            core: DeviceCore::new(name),
            open: Arc::new(AtomicBool::new(false)),
            aborts: AtomicUsize::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of times [`Device::abort`] was called.
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    fn params(&self, params: &Value) -> Result<ShutterParams> {
        let p: ShutterParams = parse_params(self.name(), params)?;
        if !(p.hold >= 0.) {
            return Err(Error::invalid(self.name(), format!("invalid hold {}", p.hold)));
        }
        Ok(p)
    }
}

impl Device for SimShutter {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn requirements(&self, params: &Value) -> Result<Requirements> {
        let p = self.params(params)?;
        Ok(Requirements {
            min_duration: p.hold,
            ..Requirements::unclocked()
        })
    }

    fn configure(&self, params: &Value, ctx: &ConfigureContext) -> Result<Box<dyn DeviceTask>> {
        let p = self.params(params)?;
        Ok(Box::new(SimShutterTask {
            open: self.open.clone(),
            want_open: p.open,
            hold: p.hold,
            timeline: Timeline::new(ctx.duration),
        }))
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::warn!(device = %self.name(), "shutter closed by abort");
        }
    }

    fn get_param(&self, name: &str) -> Option<Value> {
        match name {
            "open" => Some(json!(self.is_open())),
            _ => None,
        }
    }
}

struct SimShutterTask {
    open: Arc<AtomicBool>,
    want_open: bool,
    hold: f64,
    timeline: Timeline,
}

impl DeviceTask for SimShutterTask {
    fn start(&mut self, trigger: &StartTrigger) -> Result<()> {
        if self.want_open {
            self.open.store(true, Ordering::SeqCst);
        }
        self.timeline.start(trigger.scheduled());
        Ok(())
    }

    fn is_done(&mut self) -> Result<bool> {
        Ok(self.timeline.is_done())
    }

    fn stop(&mut self, _abort: bool) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.timeline.stop();
        Ok(())
    }

    fn result(self: Box<Self>) -> Result<DeviceResult> {
        Ok(DeviceResult::empty(self.timeline.start_epoch()).with_settings(json!({
            "open": self.want_open,
            "hold": self.hold,
        })))
    }
}
