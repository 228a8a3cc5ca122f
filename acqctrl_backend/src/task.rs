//! # Coordinated multi-device tasks
//!
//! A [`Task`] drives every device named by a [`TaskDescription`] through one acquisition:
//!
//! 1. [`Task::new`] (via [`Manager::create_task`]) resolves devices, asks each for its
//!    [`Requirements`], checks that dependencies and the clock master are part of the task,
//!    and fixes the configuration order. Nothing is reserved yet.
//! 2. [`Task::reserve_devices`] takes every device lock in ascending name order.
//! 3. [`Task::configure`] configures devices in dependency order; masters publish their
//!    clock to the slaves configured after them.
//! 4. [`Task::execute`] starts the master first, then the slaves, and (if blocking) polls
//!    until every device is done, the deadline passes, or an abort arrives.
//! 5. [`Task::get_result`] merges per-device results on the master time base.
//! 6. [`Task::release_devices`] releases in reverse acquisition order. It also runs on
//!    every failure path and on drop.
//!
//! [`Task::run`] chains all of the above.
//!
//! ## Failures
//! Errors returned by the public steps are also written to the current directory's log
//! (`source=task`). On a failure after start every started device is stopped with
//! `abort`, partial results are collected (and stored when `storeData` is set) and the
//! reservations are released before the error is returned.

use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use acq_backend::clock::{self, secs, TickTimer};
use acq_backend::error::{Error, Result};
use acq_backend::{
    ClockInfo, ClockRole, ConfigureContext, Device, DeviceResult, DeviceState, DeviceTask, ProtocolRecord,
    Requirements, StartTrigger, TaskDescription, TaskResult, TaskStatus,
};

use crate::abort::AbortSubscription;
use crate::manager::{ActiveGuard, Manager};

/// Task lifecycle. Any state may end in `Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Reserved,
    Configured,
    Running,
    Stopped,
    Result,
    Released,
}

/// Cloneable handle that aborts one task from another thread.
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Task {
    manager: Manager,
    desc: TaskDescription,
    devices: IndexMap<String, Arc<dyn Device>>,
    master: Option<String>,
    /// Configuration order (dependencies first).
    order: Vec<String>,
    duration: f64,
    state: TaskState,
    reserved: Vec<Arc<dyn Device>>,
    device_tasks: IndexMap<String, Box<dyn DeviceTask>>,
    clocks: IndexMap<String, ClockInfo>,
    started: Vec<String>,
    started_at: Option<Instant>,
    start_time: Option<f64>,
    results: IndexMap<String, DeviceResult>,
    status: Option<TaskStatus>,
    aborted: AbortHandle,
    abort_sub: Option<AbortSubscription>,
    active: Option<ActiveGuard>,
}

impl Task {
    pub fn new(manager: Manager, desc: TaskDescription) -> Result<Self> {
        desc.protocol.validate()?;
        let mut devices = IndexMap::new();
        let mut reqs: IndexMap<String, Requirements> = IndexMap::new();
        for (name, params) in desc.devices.iter() {
            let device = manager.get_device(name)?;
            reqs.insert(name.clone(), device.requirements(params)?);
            devices.insert(name.clone(), device);
        }

        let masters: Vec<&str> = reqs
            .iter()
            .filter(|(_, r)| matches!(r.clock, ClockRole::Master { .. }))
            .map(|(n, _)| n.as_str())
            .collect();
        if masters.len() > 1 {
            return Err(Error::invalid(
                desc.name(),
                format!("only one clock master allowed, found {}", masters.join(", ")),
            ));
        }
        let master = masters.first().map(|m| m.to_string());

        for (name, r) in reqs.iter() {
            if let Some(missing) = r.depends_on.iter().find(|d| !devices.contains_key(*d)) {
                return Err(Error::invalid(
                    name,
                    format!("requires device '{}' in the same task", missing),
                ));
            }
            if let ClockRole::Slave { master: m } = &r.clock {
                if master.as_ref() != Some(m) {
                    return Err(Error::invalid(
                        name,
                        format!("clock master '{}' is not part of this task", m),
                    ));
                }
            }
        }

        let order = config_order(&reqs)?;
        let duration = reqs
            .values()
            .map(|r| r.min_duration)
            .fold(desc.protocol.duration, f64::max);
        tracing::debug!(task = desc.name(), ?order, duration, "task created");

        Ok(Self {
            manager,
            desc,
            devices,
            master,
            order,
            duration,
            state: TaskState::Created,
            reserved: Vec::new(),
            device_tasks: IndexMap::new(),
            clocks: IndexMap::new(),
            started: Vec::new(),
            started_at: None,
            start_time: None,
            results: IndexMap::new(),
            status: None,
            aborted: AbortHandle(Arc::new(AtomicBool::new(false))),
            abort_sub: None,
            active: None,
        })
    }

    pub fn name(&self) -> &str {
        self.desc.name()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn description(&self) -> &TaskDescription {
        &self.desc
    }

    /// Effective duration: the longest of the protocol duration and every device's minimum.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    pub fn config_order(&self) -> &[String] {
        &self.order
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborted.clone()
    }

    fn expect_state(&self, expected: TaskState, op: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::invalid(
                self.name(),
                format!("cannot {} in state {:?}", op, self.state),
            ))
        }
    }

    fn report<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            self.manager.log_task_error(self.name(), e);
        }
        outcome
    }

    // Reserve ------------------------------------------------------------

    /// Reserves every device in ascending name order. On failure (typically
    /// [`Error::Contended`]) everything reserved so far is released and the task may retry.
    pub fn reserve_devices(&mut self) -> Result<()> {
        let outcome = self.reserve_inner();
        self.report(outcome)
    }

    fn reserve_inner(&mut self) -> Result<()> {
        self.expect_state(TaskState::Created, "reserve")?;
        self.aborted.0.store(false, Ordering::SeqCst);
        let flag = self.aborted.clone();
        self.abort_sub = Some(self.manager.abort_bus().subscribe(move || flag.abort()));
        self.active = Some(self.manager.enter_active());

        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        let timeout = self.manager.config().reserve_timeout();
        let owner = self.name().to_string();
        let mut timer = TickTimer::new();
        for name in names {
            let device = self.devices[&name].clone();
            let flag = self.aborted.clone();
            match device.reserve(&owner, timeout, &move || flag.is_aborted()) {
                Ok(()) => self.reserved.push(device),
                Err(e) => {
                    self.release_devices();
                    return Err(e);
                }
            }
        }
        timer.tick_print(&format!("{} reserve", owner));
        self.state = TaskState::Reserved;
        Ok(())
    }

    // Configure ----------------------------------------------------------

    /// Configures every device in dependency order. Any error releases the task before
    /// anything has started.
    pub fn configure(&mut self) -> Result<()> {
        let outcome = self.configure_inner();
        self.report(outcome)
    }

    fn configure_inner(&mut self) -> Result<()> {
        self.expect_state(TaskState::Reserved, "configure")?;
        let mut clocks = IndexMap::new();
        for name in self.order.clone() {
            let device = self.devices[&name].clone();
            let configured = {
                let ctx = ConfigureContext {
                    task_name: self.desc.name(),
                    duration: self.duration,
                    lead_time: self.desc.protocol.lead_time,
                    clocks: &clocks,
                };
                device.configure(&self.desc.devices[&name], &ctx)
            };
            match configured {
                Ok(task) => {
                    if let Some(clock) = task.clock_info() {
                        clocks.insert(name.clone(), clock);
                    }
                    device.core().set_state(DeviceState::Configured);
                    self.device_tasks.insert(name, task);
                }
                Err(e) => {
                    device.core().set_state(DeviceState::Error);
                    self.release_devices();
                    return Err(e);
                }
            }
        }
        self.clocks = clocks;
        self.state = TaskState::Configured;
        Ok(())
    }

    // Execute ------------------------------------------------------------

    /// Starts every device: the clock master first, then the rest in configuration order.
    /// With `block`, also waits for completion (see [`Task::wait`]).
    ///
    /// A zero-duration task starts nothing and completes immediately with empty results.
    pub fn execute(&mut self, block: bool) -> Result<()> {
        let outcome = self.execute_inner(block);
        self.report(outcome)
    }

    fn execute_inner(&mut self, block: bool) -> Result<()> {
        self.expect_state(TaskState::Configured, "execute")?;
        if self.aborted.is_aborted() {
            return Err(self.fail(Error::Aborted));
        }
        let trigger = StartTrigger::new(Instant::now() + secs(self.desc.protocol.lead_time));
        self.started_at = Some(Instant::now());

        if self.duration <= 0. {
            self.start_time = Some(clock::to_epoch(trigger.scheduled()));
            self.state = TaskState::Running;
            return self.complete();
        }

        let mut start_order: Vec<String> = self.master.iter().cloned().collect();
        start_order.extend(self.order.iter().filter(|n| Some(*n) != self.master.as_ref()).cloned());
        for name in start_order {
            let device = self.devices[&name].clone();
            let Some(task) = self.device_tasks.get_mut(&name) else { continue };
            device.core().set_state(DeviceState::Running);
            if let Err(e) = task.start(&trigger) {
                device.core().set_state(DeviceState::Error);
                return Err(self.fail(e));
            }
            self.started.push(name);
        }
        let first_tick = trigger.fired_at().unwrap_or_else(|| trigger.scheduled());
        self.start_time = Some(clock::to_epoch(first_tick));
        self.state = TaskState::Running;
        tracing::info!(task = self.name(), duration = self.duration, devices = self.started.len(), "task started");

        if block {
            self.wait_inner()
        } else {
            Ok(())
        }
    }

    /// Polls every device until all are done.
    ///
    /// Fails [`Error::Timeout`] after `duration + leadTime + timeout_margin`,
    /// [`Error::Aborted`] when the AbortBus fires, or with the first device error.
    pub fn wait(&mut self) -> Result<()> {
        let outcome = self.wait_inner();
        self.report(outcome)
    }

    fn wait_inner(&mut self) -> Result<()> {
        self.expect_state(TaskState::Running, "wait")?;
        let margin = self
            .desc
            .protocol
            .timeout_margin
            .unwrap_or(self.manager.config().timeout_margin);
        let budget = self.duration + self.desc.protocol.lead_time + margin;
        let deadline = self.started_at.unwrap_or_else(Instant::now) + secs(budget);
        let poll = self.manager.config().poll_interval();
        let host_tick = self.manager.host_tick();

        loop {
            if self.aborted.is_aborted() {
                return Err(self.fail(Error::Aborted));
            }
            let mut all_done = true;
            let mut failure = None;
            for task in self.device_tasks.values_mut() {
                match task.is_done() {
                    Ok(done) => all_done &= done,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                return Err(self.fail(e));
            }
            if all_done {
                break;
            }
            if Instant::now() >= deadline {
                return Err(self.fail(Error::Timeout(budget)));
            }
            host_tick();
            thread::sleep(poll);
        }

        for name in self.started.clone() {
            if let Some(task) = self.device_tasks.get_mut(&name) {
                if let Err(e) = task.stop(false) {
                    return Err(self.fail(e));
                }
            }
            self.devices[&name].core().set_state(DeviceState::Stopped);
        }
        self.complete()
    }

    /// Collects results after a normal finish.
    fn complete(&mut self) -> Result<()> {
        while let Some((name, task)) = self.device_tasks.shift_remove_index(0) {
            match task.result() {
                Ok(r) => {
                    self.results.insert(name, r);
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        let incomplete = self.results.values().any(|r| r.incomplete);
        self.status = Some(if incomplete {
            TaskStatus::Incomplete
        } else {
            TaskStatus::Completed
        });
        self.state = TaskState::Stopped;
        tracing::info!(task = self.name(), status = ?self.status, "task finished");
        Ok(())
    }

    /// Failure after reservation: stops started devices with `abort`, keeps what they
    /// acquired, stores it when `storeData` is set, and releases every reservation.
    fn fail(&mut self, err: Error) -> Error {
        tracing::warn!(task = self.name(), error = %err, "stopping all devices");
        for name in self.started.iter().rev() {
            if let Some(task) = self.device_tasks.get_mut(name) {
                if let Err(e) = task.stop(true) {
                    tracing::warn!(device = %name, error = %e, "stop failed");
                }
            }
            let core = self.devices[name].core();
            if core.state() != DeviceState::Error {
                core.set_state(DeviceState::Stopped);
            }
        }
        for (name, task) in self.device_tasks.drain(..) {
            match task.result() {
                Ok(r) => {
                    self.results.insert(name, r);
                }
                Err(e) => tracing::warn!(device = %name, error = %e, "no partial result"),
            }
        }
        self.status = Some(match err {
            Error::Aborted => TaskStatus::Aborted,
            _ => TaskStatus::Failed,
        });
        self.state = TaskState::Stopped;
        if self.desc.protocol.store_data && !self.results.is_empty() {
            if let Some(partial) = self.partial_result() {
                if let Err(e) = self.manager.store_result(&partial) {
                    tracing::warn!(error = %e, "could not store partial result");
                }
            }
        }
        self.release_devices();
        err
    }

    // Results ------------------------------------------------------------

    /// Merged result on the master time base.
    ///
    /// Every clocked result must sample at an integer divisor of the master rate (the
    /// factor is recorded as its `downsample`) and start within one master sample of the
    /// master, otherwise [`Error::ClockMismatch`]. With `strict`, a short acquisition fails
    /// [`Error::StoppedEarly`]; otherwise the result is flagged incomplete.
    pub fn get_result(&mut self) -> Result<TaskResult> {
        let outcome = self.get_result_inner();
        self.report(outcome)
    }

    fn get_result_inner(&mut self) -> Result<TaskResult> {
        if !matches!(self.state, TaskState::Stopped | TaskState::Result) {
            return Err(Error::invalid(
                self.name(),
                format!("no result in state {:?}", self.state),
            ));
        }
        let mut devices = self.results.clone();
        self.reconcile(&mut devices)?;
        if self.desc.protocol.strict {
            if let Some((name, r)) = devices.iter().find(|(_, r)| r.incomplete) {
                return Err(Error::StoppedEarly {
                    device: name.clone(),
                    acquired: r.num_samples(),
                    expected: r.expected_samples,
                });
            }
        }
        self.state = TaskState::Result;
        Ok(self.assemble(devices))
    }

    /// Whatever was collected, without time-base checks. `None` before anything ran.
    pub fn partial_result(&self) -> Option<TaskResult> {
        if self.status.is_none() {
            return None;
        }
        let mut devices = self.results.clone();
        for r in devices.values_mut() {
            if self.status != Some(TaskStatus::Completed) {
                r.incomplete = r.incomplete || r.num_samples() < r.expected_samples;
            }
        }
        Some(self.assemble(devices))
    }

    fn assemble(&self, devices: IndexMap<String, DeviceResult>) -> TaskResult {
        let mut params = self.desc.to_value();
        if let Some(Value::Object(protocol)) = params.get_mut("protocol") {
            protocol.insert("duration".to_string(), json!(self.duration));
        }
        TaskResult {
            devices,
            protocol: ProtocolRecord {
                params,
                start_time: self.start_time.unwrap_or_default(),
                status: self.status.unwrap_or(TaskStatus::Completed),
            },
        }
    }

    fn reconcile(&self, devices: &mut IndexMap<String, DeviceResult>) -> Result<()> {
        let master = self
            .master
            .as_ref()
            .and_then(|m| self.clocks.get(m).map(|c| (m.as_str(), c.rate)));
        let master_start = master
            .and_then(|(m, _)| devices.get(m))
            .map(|r| r.start_time)
            .or(self.start_time)
            .unwrap_or_default();
        for (name, r) in devices.iter_mut() {
            let Some(rate) = r.rate else { continue };
            let Some((_, master_rate)) = master else {
                return Err(Error::ClockMismatch {
                    device: name.clone(),
                    reason: "clocked result without a clock master".to_string(),
                });
            };
            let ratio = master_rate / rate;
            let factor = ratio.round();
            if factor < 1. || (ratio - factor).abs() > 1e-9 * ratio {
                return Err(Error::ClockMismatch {
                    device: name.clone(),
                    reason: format!(
                        "rate {} Hz is not an integer divisor of the master rate {} Hz",
                        rate, master_rate
                    ),
                });
            }
            let offset = (r.start_time - master_start).abs();
            if r.num_samples() > 0 && offset > 1. / master_rate {
                return Err(Error::ClockMismatch {
                    device: name.clone(),
                    reason: format!("first sample {:.3e} s away from the master's", offset),
                });
            }
            r.downsample = factor as usize;
        }
        Ok(())
    }

    // Release ------------------------------------------------------------

    /// Releases every reservation in reverse acquisition order. Idempotent.
    pub fn release_devices(&mut self) {
        self.device_tasks.clear();
        while let Some(device) = self.reserved.pop() {
            device.release();
            tracing::debug!(task = self.desc.name(), device = %device.name(), "released");
        }
        self.abort_sub = None;
        self.active = None;
        if self.state != TaskState::Created {
            self.state = TaskState::Released;
        }
    }

    /// Reserve, configure, execute, collect and release. The result is stored under the
    /// current directory when `storeData` is set.
    pub fn run(&mut self) -> Result<TaskResult> {
        let outcome = self.run_steps();
        self.release_devices();
        let result = outcome?;
        if self.desc.protocol.store_data {
            let stored = self.manager.store_result(&result);
            self.report(stored)?;
        }
        Ok(result)
    }

    fn run_steps(&mut self) -> Result<TaskResult> {
        self.reserve_devices()?;
        self.configure()?;
        self.execute(true)?;
        self.get_result()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.release_devices();
    }
}

/// Dependency-first order; ties keep description order. Slaves depend on their master.
fn config_order(reqs: &IndexMap<String, Requirements>) -> Result<Vec<String>> {
    let deps: IndexMap<&str, Vec<&str>> = reqs
        .iter()
        .map(|(name, r)| {
            let mut d: Vec<&str> = r.depends_on.iter().map(String::as_str).collect();
            if let ClockRole::Slave { master } = &r.clock {
                if !d.contains(&master.as_str()) {
                    d.push(master.as_str());
                }
            }
            (name.as_str(), d)
        })
        .collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(reqs.len());
    while order.len() < reqs.len() {
        let next = deps
            .iter()
            .find(|(name, d)| !placed.contains(*name) && d.iter().all(|x| placed.contains(x)))
            .map(|(name, _)| *name);
        match next {
            Some(name) => {
                placed.insert(name);
                order.push(name.to_string());
            }
            None => {
                let stuck = deps
                    .keys()
                    .find(|n| !placed.contains(*n))
                    .copied()
                    .unwrap_or_default();
                return Err(Error::invalid(stuck, "circular device dependency"));
            }
        }
    }
    Ok(order)
}
