//! # Background test pulses
//!
//! A [`TestPulseRunner`] owns one worker thread per patch-clamp channel. Each cycle it
//! builds a two-device task (the clamp and its DAQ), runs it through the [`Manager`],
//! averages the repetitions, analyses the response and, when auto-bias is enabled, nudges
//! the clamp's holding level before the next pulse.
//!
//! Parameters travel through a [`CmdChan`]: [`TestPulseRunner::set_parameters`] merges and
//! publishes a new version that the worker picks up at the start of its next pulse. A pulse
//! in flight is never interrupted by a parameter change.
//!
//! The worker stops on [`TestPulseRunner::stop`], on the manager's AbortBus, or after
//! `max_failures` consecutive failed pulses (reported as [`TestPulseEvent::Failed`]).

use crossbeam::channel::{self, RecvTimeoutError};
use ndarray::{s, Array1, ArrayView1};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use acq_backend::clock::secs;
use acq_backend::error::{Error, Result};
use acq_backend::events::Emitter;
use acq_backend::{ClampDevice, ClampMode, DeviceResult, TaskDescription, Waveform};

use crate::manager::Manager;
use crate::worker_cmd_chan::{CmdChan, CmdRecvr};

const SLEEP_SLICE: Duration = Duration::from_millis(30);
const STOP_TIMEOUT: f64 = 10.;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoBias {
    pub enabled: bool,
    /// Membrane potential to hold the cell at in current clamp (V).
    pub target: f64,
    /// Fraction of the estimated correction applied per pulse, in `(0, 1]`.
    pub follow_rate: f64,
    pub min_current: f64,
    pub max_current: f64,
    /// In voltage clamp, the IC holding is set to `baseline_current * vc_carryover`.
    pub vc_carryover: f64,
}

impl Default for AutoBias {
    fn default() -> Self {
        Self {
            enabled: false,
            target: -0.070,
            follow_rate: 0.5,
            min_current: -1e-9,
            max_current: 1e-9,
            vc_carryover: 0.5,
        }
    }
}

/// One test-pulse configuration. Durations in seconds, amplitude in the command units of
/// the clamp mode (V in VC, A in IC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TestPulseParams {
    /// `None` keeps the amplifier's current mode.
    pub mode: Option<ClampMode>,
    pub sample_rate: f64,
    pub downsample: usize,
    pub pre_duration: f64,
    pub pulse_duration: f64,
    pub post_duration: f64,
    pub amplitude: f64,
    pub average_count: usize,
    /// Minimum period between pulse starts; `None` runs back-to-back.
    pub interval: Option<f64>,
    pub auto_bias: AutoBias,
}

impl Default for TestPulseParams {
    fn default() -> Self {
        Self {
            mode: None,
            sample_rate: 500e3,
            downsample: 20,
            pre_duration: 0.005,
            pulse_duration: 0.010,
            post_duration: 0.005,
            amplitude: -0.010,
            average_count: 1,
            interval: None,
            auto_bias: AutoBias::default(),
        }
    }
}

impl TestPulseParams {
    pub fn total_duration(&self) -> f64 {
        self.pre_duration + self.pulse_duration + self.post_duration
    }

    /// Recorded sample rate after downsampling.
    pub fn output_rate(&self) -> f64 {
        self.sample_rate / self.downsample.max(1) as f64
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |reason: String| -> Result<()> { Err(Error::invalid("testPulse", reason)) };
        if self.downsample == 0 || !(self.sample_rate > 0.) {
            return bad(format!("invalid rate {} / {}", self.sample_rate, self.downsample));
        }
        if self.output_rate() < 1e3 {
            return bad(format!("output rate {} Hz is below 1 kHz", self.output_rate()));
        }
        let durations = [self.pre_duration, self.pulse_duration, self.post_duration];
        if durations.iter().any(|d| !(*d >= 0.)) || !(self.pulse_duration > 0.) {
            return bad(format!("invalid durations {:?}", durations));
        }
        if (self.pre_duration * self.output_rate()).round() < 1. {
            return bad(format!("pre_duration {} leaves no baseline sample", self.pre_duration));
        }
        if !self.amplitude.is_finite() {
            return bad(format!("invalid amplitude {}", self.amplitude));
        }
        if self.average_count == 0 {
            return bad("average_count must be at least 1".to_string());
        }
        if let Some(interval) = self.interval {
            if !(interval >= 0.) {
                return bad(format!("invalid interval {}", interval));
            }
        }
        let ab = &self.auto_bias;
        if !(ab.follow_rate > 0. && ab.follow_rate <= 1.) {
            return bad(format!("follow_rate {} outside (0, 1]", ab.follow_rate));
        }
        if !(ab.min_current <= ab.max_current) {
            return bad(format!("min_current {} above max_current {}", ab.min_current, ab.max_current));
        }
        Ok(())
    }

    /// Returns a copy with the fields present in `patch` replaced. `auto_bias` merges
    /// field by field.
    pub fn merged(&self, patch: &Value) -> Result<Self> {
        let Value::Object(patch) = patch else {
            return Err(Error::invalid("testPulse", "parameters must be an object"));
        };
        let mut current = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in patch.iter() {
                match (fields.get_mut(key), value) {
                    (Some(Value::Object(inner)), Value::Object(more)) => {
                        inner.extend(more.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    _ => {
                        fields.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        let merged: Self = serde_json::from_value(current)
            .map_err(|e| Error::invalid("testPulse", e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }
}

/// Measurements from one averaged test pulse. Quantities that cannot be measured in the
/// pulse's clamp mode are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestPulseAnalysis {
    pub mode: Option<ClampMode>,
    pub baseline_potential: Option<f64>,
    pub baseline_current: Option<f64>,
    pub peak_current: Option<f64>,
    pub peak_potential: Option<f64>,
    pub steady_state_current: Option<f64>,
    pub steady_state_potential: Option<f64>,
    pub access_resistance: Option<f64>,
    pub input_resistance: Option<f64>,
    pub steady_state_resistance: Option<f64>,
    pub time_constant: Option<f64>,
}

/// Averaged response handed to listeners and post-processing.
#[derive(Debug, Clone)]
pub struct TestPulseResult {
    pub params: TestPulseParams,
    pub mode: ClampMode,
    pub holding: f64,
    pub rate: f64,
    pub primary: Array1<f64>,
    pub command: Array1<f64>,
    pub start_time: f64,
}

#[derive(Debug, Clone)]
pub enum TestPulseEvent {
    PulseFinished {
        device: String,
        analysis: TestPulseAnalysis,
        result: Arc<TestPulseResult>,
    },
    Failed {
        device: String,
        error: String,
    },
}

/// User hook run on every pulse after the built-in analysis; may amend the analysis.
pub type PostProcess = Arc<dyn Fn(&TestPulseResult, &mut TestPulseAnalysis) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_delay: Duration,
    /// Consecutive failures that stop the runner.
    pub max_failures: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            max_failures: 3,
        }
    }
}

struct Shared {
    manager: Manager,
    clamp: String,
    daq: String,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    events: Emitter<TestPulseEvent>,
    post: RwLock<Option<PostProcess>>,
    retry: RwLock<RetryPolicy>,
}

struct Worker {
    handle: JoinHandle<()>,
    done: channel::Receiver<()>,
}

type CacheKey = (usize, ClampMode, u64);

pub struct TestPulseRunner {
    shared: Arc<Shared>,
    params: CmdChan<TestPulseParams>,
    worker: Mutex<Option<Worker>>,
}

impl TestPulseRunner {
    /// Runner for the clamp device `clamp`; its DAQ is taken from the amplifier wiring.
    pub fn new(manager: Manager, clamp: &str) -> Result<Self> {
        let device = manager.get_device(clamp)?;
        let daq = device
            .as_clamp()
            .ok_or_else(|| Error::invalid(clamp, "not a patch-clamp device"))?
            .daq_name()
            .to_string();
        manager.get_device(&daq)?;
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                clamp: clamp.to_string(),
                daq,
                stop: Arc::new(AtomicBool::new(false)),
                running: AtomicBool::new(false),
                events: Emitter::new(),
                post: RwLock::new(None),
                retry: RwLock::new(RetryPolicy::default()),
            }),
            params: CmdChan::new(TestPulseParams::default()),
            worker: Mutex::new(None),
        })
    }

    pub fn clamp_name(&self) -> &str {
        &self.shared.clamp
    }

    pub fn events(&self) -> &Emitter<TestPulseEvent> {
        &self.shared.events
    }

    /// Current (version, parameters).
    pub fn parameters(&self) -> (usize, TestPulseParams) {
        self.params.latest()
    }

    /// Merges `patch` (a partial [`TestPulseParams`] object) into the current parameters.
    /// Invalid patches are rejected without bumping the version.
    pub fn set_parameters(&self, patch: Value) -> Result<usize> {
        self.params.try_update(|p| {
            *p = p.merged(&patch)?;
            Ok(())
        })
    }

    /// Typed variant of [`TestPulseRunner::set_parameters`].
    pub fn update_parameters<F: FnOnce(&mut TestPulseParams)>(&self, edit: F) -> Result<usize> {
        self.params.try_update(|p| {
            edit(p);
            p.validate()
        })
    }

    pub fn set_post_processing(&self, hook: Option<PostProcess>) {
        *self.shared.post.write() = hook;
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.shared.retry.write() = policy;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Starts the worker. A worker still finishing its pulse after `stop(false)` is waited
    /// for (up to 10 s) and replaced.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.is_running() && !self.shared.stopping() {
            return Ok(());
        }
        if let Some(old) = worker.take() {
            if let Err(RecvTimeoutError::Timeout) = old.done.recv_timeout(secs(STOP_TIMEOUT)) {
                *worker = Some(old);
                return Err(Error::Timeout(STOP_TIMEOUT));
            }
            let _ = old.handle.join();
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let shared = self.shared.clone();
        let recvr = self.params.new_recvr();
        let spawned = thread::Builder::new()
            .name(format!("testpulse-{}", self.shared.clamp))
            .spawn(move || {
                let _done = done_tx;
                shared.run_loop(recvr);
                shared.running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, done: done_rx });
                tracing::info!(device = %self.shared.clamp, "test pulses started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(Error::device_failure(&self.shared.clamp, e))
            }
        }
    }

    /// Asks the worker to exit after its current pulse. With `block`, waits up to 10 s.
    pub fn stop(&self, block: bool) -> Result<()> {
        self.shared.stop.store(true, Ordering::SeqCst);
        if !block {
            return Ok(());
        }
        let mut worker = self.worker.lock();
        let Some(w) = worker.take() else { return Ok(()) };
        match w.done.recv_timeout(secs(STOP_TIMEOUT)) {
            Err(RecvTimeoutError::Timeout) => {
                *worker = Some(w);
                Err(Error::Timeout(STOP_TIMEOUT))
            }
            _ => {
                let _ = w.handle.join();
                tracing::info!(device = %self.shared.clamp, "test pulses stopped");
                Ok(())
            }
        }
    }

    /// Runs one pulse on the calling thread with the current parameters.
    pub fn run_once(&self) -> Result<(TestPulseAnalysis, TestPulseResult)> {
        let (version, params) = self.params.latest();
        let mut cache = None;
        self.shared.pulse(version, &params, &mut cache)
    }
}

impl Drop for TestPulseRunner {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps in short slices until `until`; false if a stop was requested meanwhile.
    fn sleep_until(&self, until: Instant) -> bool {
        loop {
            if self.stopping() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }

    fn run_loop(&self, mut recvr: CmdRecvr<TestPulseParams>) {
        let flag = self.stop.clone();
        let _abort = self
            .manager
            .abort_bus()
            .subscribe(move || flag.store(true, Ordering::SeqCst));

        let mut cache: Option<(CacheKey, TaskDescription)> = None;
        let mut failures = 0;
        while !self.stopping() {
            let cycle = Instant::now();
            if recvr.has_news() {
                tracing::debug!(device = %self.clamp, "picking up new test pulse parameters");
            }
            let (version, params) = recvr.latest();
            match self.pulse(version, &params, &mut cache) {
                Ok((analysis, result)) => {
                    failures = 0;
                    self.events.emit(&TestPulseEvent::PulseFinished {
                        device: self.clamp.clone(),
                        analysis,
                        result: Arc::new(result),
                    });
                }
                Err(Error::StopRequested) => break,
                Err(_) if self.stopping() => break,
                Err(e) => {
                    failures += 1;
                    let policy = *self.retry.read();
                    tracing::warn!(device = %self.clamp, error = %e, failures, "test pulse failed");
                    if failures >= policy.max_failures {
                        tracing::error!(device = %self.clamp, error = %e, "giving up on test pulses");
                        self.events.emit(&TestPulseEvent::Failed {
                            device: self.clamp.clone(),
                            error: e.to_string(),
                        });
                        break;
                    }
                    if !self.sleep_until(Instant::now() + policy.retry_delay) {
                        break;
                    }
                    continue;
                }
            }
            let wait = params.interval.map(secs).unwrap_or_default();
            if !self.sleep_until(cycle + wait) {
                break;
            }
        }
        tracing::debug!(device = %self.clamp, "test pulse loop exited");
    }

    fn describe(&self, params: &TestPulseParams, mode: ClampMode, holding: f64) -> Result<TaskDescription> {
        let period = (params.total_duration() * params.sample_rate).round() as usize;
        let mut wave = Waveform::new(params.sample_rate, holding);
        if mode != ClampMode::I0 && params.amplitude != 0. {
            wave.constant(holding + params.amplitude, params.pre_duration, params.pulse_duration, false)?;
        }
        let command = wave.render_repeated(period, params.average_count);

        let mut desc = TaskDescription::new(params.total_duration() * params.average_count as f64).with_name("testPulse");
        desc = desc
            .with_device(
                &self.daq,
                json!({"rate": params.sample_rate, "downsample": params.downsample}),
            )
            .with_device(
                &self.clamp,
                json!({"mode": mode, "command": command.to_vec()}),
            );
        Ok(desc)
    }

    fn pulse(
        &self,
        version: usize,
        params: &TestPulseParams,
        cache: &mut Option<(CacheKey, TaskDescription)>,
    ) -> Result<(TestPulseAnalysis, TestPulseResult)> {
        if self.stopping() {
            return Err(Error::StopRequested);
        }
        let device = self.manager.get_device(&self.clamp)?;
        let clamp = device
            .as_clamp()
            .ok_or_else(|| Error::invalid(&self.clamp, "not a patch-clamp device"))?;
        let mode = params.mode.unwrap_or_else(|| clamp.mode());
        let holding = clamp.holding(mode);

        let key = (version, mode, holding.to_bits());
        let cached = cache.as_ref().filter(|(k, _)| *k == key).map(|(_, d)| d.clone());
        let desc = match cached {
            Some(desc) => desc,
            None => {
                let desc = self.describe(params, mode, holding)?;
                *cache = Some((key, desc.clone()));
                desc
            }
        };

        let result = self.manager.create_task(desc)?.run()?;
        let response = result
            .get(&self.clamp)
            .ok_or_else(|| Error::device_failure(&self.clamp, "no clamp data in task result"))?;
        let averaged = average(&self.clamp, response, params.average_count)?;
        let pulse = TestPulseResult {
            params: params.clone(),
            mode,
            holding,
            rate: response.rate.unwrap_or_else(|| params.output_rate()),
            primary: averaged.0,
            command: averaged.1,
            start_time: response.start_time,
        };

        let mut analysis = analyze(&pulse);
        let hook = self.post.read().clone();
        if let Some(hook) = hook {
            hook(&pulse, &mut analysis);
        }
        if params.auto_bias.enabled {
            self.auto_bias(clamp, mode, holding, &params.auto_bias, &analysis)?;
        }
        Ok((analysis, pulse))
    }

    fn auto_bias(
        &self,
        clamp: &dyn ClampDevice,
        mode: ClampMode,
        holding: f64,
        ab: &AutoBias,
        analysis: &TestPulseAnalysis,
    ) -> Result<()> {
        match mode {
            ClampMode::VC => {
                if let Some(i) = analysis.baseline_current {
                    let carried = (i * ab.vc_carryover).clamp(ab.min_current, ab.max_current);
                    clamp.set_holding(ClampMode::IC, carried)?;
                }
            }
            // I=0 injects no step; without a resistance estimate the holding stays put.
            ClampMode::IC | ClampMode::I0 => {
                if let (Some(v), Some(r)) = (analysis.baseline_potential, analysis.steady_state_resistance) {
                    let di = (ab.target - v) / r.clamp(1e6, 10e9);
                    let next = (holding + di * ab.follow_rate).clamp(ab.min_current, ab.max_current);
                    tracing::debug!(device = %self.clamp, from = holding, to = next, "auto-bias");
                    clamp.set_holding(ClampMode::IC, next)?;
                }
            }
        }
        Ok(())
    }
}

/// (primary, command) averaged over the `count` repetitions.
fn average(device: &str, response: &DeviceResult, count: usize) -> Result<(Array1<f64>, Array1<f64>)> {
    let averaged = response.average_segments(count);
    let row = |name: &str| {
        response
            .channels
            .iter()
            .position(|c| c.name == name)
            .map(|i| averaged.row(i).to_owned())
            .ok_or_else(|| Error::device_failure(device, format!("missing channel '{}'", name)))
    };
    Ok((row("primary")?, row("command")?))
}

fn mean(x: ArrayView1<f64>, from: usize, to: usize) -> Option<f64> {
    let to = to.min(x.len());
    if from >= to {
        return None;
    }
    x.slice(s![from..to]).mean()
}

/// Baseline from the pre-pulse region, steady state from the last fifth of the pulse,
/// peak at the largest deviation from baseline during the pulse.
pub fn analyze(pulse: &TestPulseResult) -> TestPulseAnalysis {
    let p = &pulse.params;
    let rate = pulse.rate;
    let pre = (p.pre_duration * rate).round() as usize;
    let len = ((p.pulse_duration * rate).round() as usize).max(1);
    let ss_from = pre + len - (len / 5).max(1);
    let primary = pulse.primary.view();
    let command = pulse.command.view();

    let mut analysis = TestPulseAnalysis {
        mode: Some(pulse.mode),
        ..Default::default()
    };
    let (Some(base), Some(ss)) = (mean(primary, 0, pre), mean(primary, ss_from, pre + len)) else {
        return analysis;
    };
    let cmd_base = mean(command, 0, pre).unwrap_or(pulse.holding);
    let cmd_step = mean(command, pre, pre + len).map(|c| c - cmd_base).unwrap_or(0.);

    let window = primary.slice(s![pre..(pre + len).min(primary.len())]);
    let peak_idx = window
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, v)| {
            let dev = (v - base).abs();
            match best {
                Some((_, d)) if d >= dev => best,
                _ => Some((i, dev)),
            }
        })
        .map(|(i, _)| i);
    let peak = peak_idx.map(|i| window[i]);
    analysis.time_constant = peak_idx.and_then(|i| {
        let threshold = (window[i] - ss).abs() / std::f64::consts::E;
        window
            .iter()
            .skip(i)
            .position(|v| (v - ss).abs() < threshold)
            .filter(|&k| k > 0)
            .map(|k| k as f64 / rate)
    });

    let ratio = |num: f64, den: f64| (den != 0. && num.is_finite()).then(|| num / den).filter(|r| r.is_finite());
    match pulse.mode {
        ClampMode::VC => {
            analysis.baseline_potential = Some(cmd_base);
            analysis.baseline_current = Some(base);
            analysis.peak_current = peak;
            analysis.steady_state_current = Some(ss);
            analysis.access_resistance = peak.and_then(|pk| ratio(cmd_step, pk - base));
            analysis.steady_state_resistance = ratio(cmd_step, ss - base);
            analysis.input_resistance = match (analysis.steady_state_resistance, analysis.access_resistance) {
                (Some(rss), Some(ra)) => Some(rss - ra),
                _ => None,
            };
        }
        ClampMode::IC | ClampMode::I0 => {
            analysis.baseline_potential = Some(base);
            analysis.baseline_current = Some(cmd_base);
            analysis.peak_potential = peak;
            analysis.steady_state_potential = Some(ss);
            analysis.steady_state_resistance = ratio(ss - base, cmd_step);
            analysis.input_resistance = analysis.steady_state_resistance;
        }
    }
    analysis
}
