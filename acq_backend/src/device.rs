//! Abstract hardware interface. See [`Device`] for details.
//!
//! An acquisition rig consists of devices (DAQ boards, amplifiers, shutters, cameras, ...)
//! that are driven together by a task. This module only defines the contract every device
//! honours; concrete implementations live with the runtime (`acqctrl_backend::sim`).
//!
//! ## Device
//! Every [`Device`] owns a [`DeviceCore`] holding its name, its FIFO reservation lock
//! ([`DeviceLock`]) and its lifecycle state ([`DeviceState`]). The trait supplies the
//! lifecycle methods on top of that field accessor, so a concrete device only implements
//! [`Device::requirements`] and [`Device::configure`] (plus the optional capabilities it has).
//!
//! ## DeviceTask
//! [`Device::configure`] validates a parameter block and returns a single-use
//! [`DeviceTask`] which is started, polled, stopped and finally consumed by
//! [`DeviceTask::result`].
//!
//! ## Synchronization
//! Exactly one device per task may declare itself clock master ([`ClockRole::Master`]).
//! Its [`DeviceTask::start`] fires the shared [`StartTrigger`]; slaves read the trigger's
//! start instant so that their first sample is aligned with the master's.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::result::DeviceResult;

/// Lifecycle state of a device.
///
/// `Idle → Reserved → Configured → Running → Stopped → Idle`; any state may move to
/// `Error`, and `release` always returns the device to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Reserved,
    Configured,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DeviceState::Idle => "idle",
            DeviceState::Reserved => "reserved",
            DeviceState::Configured => "configured",
            DeviceState::Running => "running",
            DeviceState::Stopped => "stopped",
            DeviceState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Fair (FIFO) process-wide exclusive lock for one device.
///
/// Unlike a mutex guard, a reservation is not scoped: it is taken by [`DeviceLock::reserve`]
/// and held until [`DeviceLock::release`], typically for the whole lifetime of a task.
/// Waiters are served strictly in arrival order; a waiter that gives up (timeout or
/// cancellation) leaves the queue without disturbing the others.
pub struct DeviceLock {
    state: Mutex<LockState>,
    condvar: Condvar,
}

struct LockState {
    holder: Option<String>,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

impl DeviceLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                holder: None,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Waits for the lock in FIFO order.
    ///
    /// Returns [`Error::Contended`] naming the current holder when `timeout` elapses and
    /// [`Error::Aborted`] as soon as `cancelled` returns true (checked every 30 ms).
    pub fn reserve(
        &self,
        device: &str,
        owner: &str,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.queue.push_back(ticket);

        loop {
            if st.holder.is_none() && st.queue.front() == Some(&ticket) {
                st.queue.pop_front();
                st.holder = Some(owner.to_string());
                return Ok(());
            }
            let now = Instant::now();
            let cancel = cancelled();
            if cancel || now >= deadline {
                st.queue.retain(|t| *t != ticket);
                let holder = st.holder.clone().unwrap_or_default();
                // The next waiter may have been blocked behind this ticket
                self.condvar.notify_all();
                return Err(if cancel {
                    Error::Aborted
                } else {
                    Error::Contended {
                        device: device.to_string(),
                        holder,
                    }
                });
            }
            let slice = (deadline - now).min(Duration::from_millis(30));
            self.condvar.wait_for(&mut st, slice);
        }
    }

    /// Releases the lock. Returns `false` if it was not held.
    pub fn release(&self) -> bool {
        let mut st = self.state.lock();
        let was_held = st.holder.take().is_some();
        self.condvar.notify_all();
        was_held
    }

    pub fn holder(&self) -> Option<String> {
        self.state.lock().holder.clone()
    }
}

impl Default for DeviceLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared helper embedded in every concrete device.
pub struct DeviceCore {
    name: String,
    lock: DeviceLock,
    state: Mutex<DeviceState>,
}

impl DeviceCore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lock: DeviceLock::new(),
            state: Mutex::new(DeviceState::Idle),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn lock(&self) -> &DeviceLock {
        &self.lock
    }
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }
    pub fn set_state(&self, state: DeviceState) {
        let mut cur = self.state.lock();
        tracing::trace!(device = %self.name, from = %*cur, to = %state, "state change");
        *cur = state;
    }
}

/// Timing role a device plays within one task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockRole {
    /// Drives the sample clock at `rate` Hz.
    Master { rate: f64 },
    /// Derives its timing from the named master.
    Slave { master: String },
    /// Has no sample clock (shutters, stages, ...).
    Unclocked,
}

/// What a device needs from a task, declared before any reservation is made.
#[derive(Debug, Clone)]
pub struct Requirements {
    /// Devices that must be configured (and started) before this one.
    pub depends_on: Vec<String>,
    pub clock: ClockRole,
    /// Shortest duration in seconds this device can run with the given parameters.
    pub min_duration: f64,
}

impl Requirements {
    pub fn unclocked() -> Self {
        Self {
            depends_on: Vec::new(),
            clock: ClockRole::Unclocked,
            min_duration: 0.,
        }
    }
}

/// Clock parameters a master publishes to the slaves configured after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockInfo {
    pub rate: f64,
    /// Decimation applied to recorded data; recorded rate is `rate / downsample`.
    pub downsample: usize,
}

/// Task-wide values handed to [`Device::configure`].
pub struct ConfigureContext<'a> {
    pub task_name: &'a str,
    pub duration: f64,
    pub lead_time: f64,
    pub clocks: &'a IndexMap<String, ClockInfo>,
}

impl<'a> ConfigureContext<'a> {
    pub fn clock(&self, master: &str) -> Option<ClockInfo> {
        self.clocks.get(master).copied()
    }
}

/// Start trigger line shared by all devices of one task.
///
/// The task schedules the start instant; the master fires the line when its clock
/// starts, and slaves block on [`StartTrigger::wait`] to obtain the same instant.
pub struct StartTrigger {
    scheduled: Instant,
    fired: Mutex<Option<Instant>>,
    condvar: Condvar,
}

impl StartTrigger {
    pub fn new(scheduled: Instant) -> Self {
        Self {
            scheduled,
            fired: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub fn scheduled(&self) -> Instant {
        self.scheduled
    }

    /// Marks the first master-clock tick. Subsequent calls keep the first instant.
    pub fn fire(&self, at: Instant) -> Instant {
        let mut fired = self.fired.lock();
        let at = *fired.get_or_insert(at);
        self.condvar.notify_all();
        at
    }

    pub fn fired_at(&self) -> Option<Instant> {
        *self.fired.lock()
    }

    /// Waits up to `timeout` for the trigger.
    pub fn wait(&self, timeout: Duration) -> Option<Instant> {
        let deadline = Instant::now() + timeout;
        let mut fired = self.fired.lock();
        while fired.is_none() {
            if self.condvar.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

/// Per-device executor produced by [`Device::configure`]. Single use.
pub trait DeviceTask: Send {
    /// Begins acquisition / output. Masters fire `trigger`; slaves align to it.
    fn start(&mut self, trigger: &StartTrigger) -> Result<()>;
    fn is_done(&mut self) -> Result<bool>;
    /// Halts without releasing. With `abort` in-flight buffers are discarded.
    fn stop(&mut self, abort: bool) -> Result<()>;
    /// Consumes the task. Valid after `is_done()` returned true or after `stop`.
    /// A task that was never started yields zero-length channels.
    fn result(self: Box<Self>) -> Result<DeviceResult>;
    /// Clock published to slaves; only masters return `Some`.
    fn clock_info(&self) -> Option<ClockInfo> {
        None
    }
}

/// Recording configuration of a patch-clamp amplifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClampMode {
    VC,
    IC,
    #[serde(rename = "I=0")]
    I0,
}

impl ClampMode {
    /// Units of the holding level / command in this mode.
    pub fn command_units(&self) -> &'static str {
        match self {
            ClampMode::VC => "V",
            ClampMode::IC | ClampMode::I0 => "A",
        }
    }
    /// Units of the primary (recorded) signal in this mode.
    pub fn primary_units(&self) -> &'static str {
        match self {
            ClampMode::VC => "A",
            ClampMode::IC | ClampMode::I0 => "V",
        }
    }
}

impl fmt::Display for ClampMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ClampMode::VC => "VC",
            ClampMode::IC => "IC",
            ClampMode::I0 => "I=0",
        };
        write!(f, "{}", s)
    }
}

/// Capability set of patch-clamp amplifiers.
///
/// Holding updates are serialised by the implementation's own lock.
pub trait ClampDevice: Send + Sync {
    fn mode(&self) -> ClampMode;
    fn set_mode(&self, mode: ClampMode) -> Result<()>;
    /// Holding level for `mode`: volts in VC, amps in IC. Always 0 for `I=0`.
    fn holding(&self, mode: ClampMode) -> f64;
    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<()>;
    /// Name of the DAQ device the amplifier's signals are wired to.
    fn daq_name(&self) -> &str;
}

/// The `Device` trait is the single interface the task engine uses to drive hardware.
///
/// # Trait Methods and Their Functionality:
///
/// - **Field method**: [`Device::core`] gives access to the shared [`DeviceCore`].
/// - **Lifecycle**: [`Device::reserve`] / [`Device::release`] (default implementations over
///   the core's [`DeviceLock`]), [`Device::requirements`], [`Device::configure`].
/// - **Safety**: [`Device::abort`] puts the device into its safe state. Devices that manage
///   physical safety resources (shutters, attenuators) must override it; it must be fast,
///   idempotent and valid in any lifecycle state.
/// - **Optional capabilities**: channel listing, parameter access, [`Device::as_clamp`].
pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> DeviceState {
        self.core().state()
    }

    fn reserve(&self, owner: &str, timeout: Duration, cancelled: &dyn Fn() -> bool) -> Result<()> {
        self.core().lock().reserve(self.name(), owner, timeout, cancelled)?;
        self.core().set_state(DeviceState::Reserved);
        Ok(())
    }

    fn release(&self) {
        self.core().lock().release();
        self.core().set_state(DeviceState::Idle);
    }

    /// Validates `params` and declares dependencies, clock role and minimum duration.
    fn requirements(&self, params: &Value) -> Result<Requirements>;

    /// Validates `params`, allocates buffers and returns a fresh task.
    /// Fails [`Error::InvalidParams`] on schema mismatch.
    fn configure(&self, params: &Value, ctx: &ConfigureContext) -> Result<Box<dyn DeviceTask>>;

    fn abort(&self) {}

    fn list_channels(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_param(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set_param(&self, name: &str, _value: Value) -> Result<()> {
        Err(Error::invalid(self.name(), format!("no settable parameter '{}'", name)))
    }

    fn as_clamp(&self) -> Option<&dyn ClampDevice> {
        None
    }
}

/// Deserializes a device parameter block into its typed schema, mapping failures to
/// [`Error::InvalidParams`].
pub fn parse_params<T: serde::de::DeserializeOwned>(device: &str, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| Error::invalid(device, e.to_string()))
}
