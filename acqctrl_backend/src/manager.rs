//! # The `Manager` context
//!
//! One [`Manager`] is created per process (or per test) and threaded through everything
//! that needs shared state. It owns:
//!
//! - the device registry (`name → Device`),
//! - the data [`Store`] and the user-selected current directory,
//! - configuration ([`ManagerConfig`]) and named task-description presets,
//! - the [`AbortBus`] and the bookkeeping `abort_all` needs to wait for tasks,
//! - the [`HostEventTick`] called inside every polling sleep.
//!
//! `Manager` is a cheap handle (`Clone` shares the same context).
//!
//! ## Notifications
//! [`Manager::events`] emits [`ManagerEvent::BaseDirChanged`] when the store root changes
//! and [`ManagerEvent::CurrentDirChanged`] whenever the current directory is selected,
//! renamed, moved (directly or through an ancestor) or receives a log entry.

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use acq_backend::clock::TickTimer;
use acq_backend::error::{Error, Result};
use acq_backend::events::{Emitter, ListenerId};
use acq_backend::store::{info, FileData, Handle, HandleChange, Info, LogEntry, Store, WriteOptions};
use acq_backend::{Device, TaskDescription, TaskResult};

use crate::abort::AbortBus;
use crate::config::{load_presets, no_host_tick, HostEventTick, ManagerConfig};
use crate::task::Task;

/// What changed about the current directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirChangeCause {
    /// A different directory was selected.
    Selected,
    Moved,
    Renamed,
    /// An ancestor was renamed or moved.
    Parent,
    Log,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    BaseDirChanged(PathBuf),
    CurrentDirChanged { path: String, cause: DirChangeCause },
}

struct CurrentDir {
    handle: Handle,
    listener: ListenerId,
}

pub(crate) struct ManagerInner {
    config: ManagerConfig,
    devices: RwLock<IndexMap<String, Arc<dyn Device>>>,
    store: RwLock<Store>,
    current: Mutex<Option<CurrentDir>>,
    presets: RwLock<IndexMap<String, TaskDescription>>,
    abort_bus: AbortBus,
    active: Mutex<usize>,
    idle: Condvar,
    host_tick: RwLock<HostEventTick>,
    events: Emitter<ManagerEvent>,
}

#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

/// Counts one in-flight task for [`Manager::abort_all`]; dropping it marks the task
/// released.
pub(crate) struct ActiveGuard {
    inner: Arc<ManagerInner>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active.lock();
        *active = active.saturating_sub(1);
        self.inner.idle.notify_all();
    }
}

impl Manager {
    /// Opens (creating if needed) the store at `config.base_dir` and loads presets from
    /// `config.config_dir`. The current directory starts at the store root.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let store = Store::open(&config.base_dir)?;
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                devices: RwLock::new(IndexMap::new()),
                store: RwLock::new(store.clone()),
                current: Mutex::new(None),
                presets: RwLock::new(IndexMap::new()),
                abort_bus: AbortBus::new(),
                active: Mutex::new(0),
                idle: Condvar::new(),
                host_tick: RwLock::new(no_host_tick()),
                events: Emitter::new(),
            }),
        };
        let presets = manager.reload_presets()?;
        tracing::info!(base_dir = ?store.root_path(), presets, "manager ready");
        manager.select_current(store.root(), false)?;
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Emitter<ManagerEvent> {
        &self.inner.events
    }

    pub fn abort_bus(&self) -> &AbortBus {
        &self.inner.abort_bus
    }

    // Devices ------------------------------------------------------------

    /// Registers a device under its own name. Names are unique.
    pub fn add_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let mut devices = self.inner.devices.write();
        let name = device.name().to_string();
        if devices.contains_key(&name) {
            return Err(Error::invalid(&name, "a device with this name is already registered"));
        }
        tracing::debug!(device = %name, "registered device");
        devices.insert(name, device);
        Ok(())
    }

    pub fn get_device(&self, name: &str) -> Result<Arc<dyn Device>> {
        self.inner
            .devices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))
    }

    pub fn device_names(&self) -> Vec<String> {
        self.inner.devices.read().keys().cloned().collect()
    }

    // Tasks --------------------------------------------------------------

    /// Resolves every device of `desc`; fails [`Error::UnknownDevice`] or
    /// [`Error::InvalidParams`] before anything is reserved.
    pub fn create_task(&self, desc: TaskDescription) -> Result<Task> {
        Task::new(self.clone(), desc)
    }

    pub fn create_task_from_value(&self, desc: Value) -> Result<Task> {
        self.create_task(TaskDescription::from_value(desc)?)
    }

    pub(crate) fn enter_active(&self) -> ActiveGuard {
        *self.inner.active.lock() += 1;
        ActiveGuard {
            inner: self.inner.clone(),
        }
    }

    /// Number of tasks currently holding reservations.
    pub fn active_tasks(&self) -> usize {
        *self.inner.active.lock()
    }

    /// Signals every AbortBus subscriber, puts every device into its safe state and waits
    /// up to `abort_wait` for in-flight tasks to release their devices.
    ///
    /// Returns `true` if every task released in time. Must not be called from a task's
    /// own polling thread (e.g. from its host tick), or it waits the full `abort_wait`.
    pub fn abort_all(&self) -> bool {
        let mut timer = TickTimer::new();
        let notified = self.inner.abort_bus.trigger();
        let devices: Vec<Arc<dyn Device>> = self.inner.devices.read().values().cloned().collect();
        for device in devices.iter() {
            device.abort();
        }
        let deadline = Instant::now() + self.inner.config.abort_wait();
        let mut active = self.inner.active.lock();
        while *active > 0 {
            if self.inner.idle.wait_until(&mut active, deadline).timed_out() {
                break;
            }
        }
        let remaining = *active;
        drop(active);
        timer.tick_print("abort_all");
        if remaining == 0 {
            tracing::info!(subscribers = notified, devices = devices.len(), "abort complete");
        } else {
            tracing::error!(remaining, "tasks still active after abort");
        }
        remaining == 0
    }

    pub fn set_host_tick(&self, tick: HostEventTick) {
        *self.inner.host_tick.write() = tick;
    }

    pub fn host_tick(&self) -> HostEventTick {
        self.inner.host_tick.read().clone()
    }

    // Presets ------------------------------------------------------------

    pub fn preset(&self, name: &str) -> Result<TaskDescription> {
        self.inner.presets.read().get(name).cloned().ok_or_else(|| {
            let dir = self.inner.config.config_dir.clone().unwrap_or_default();
            Error::NotFound(dir.join(format!("{}.json", name)))
        })
    }

    pub fn preset_names(&self) -> Vec<String> {
        self.inner.presets.read().keys().cloned().collect()
    }

    /// Re-reads the preset directory.
    pub fn reload_presets(&self) -> Result<usize> {
        let presets = match &self.inner.config.config_dir {
            Some(dir) => load_presets(dir)?,
            None => IndexMap::new(),
        };
        let count = presets.len();
        *self.inner.presets.write() = presets;
        Ok(count)
    }

    // Directories --------------------------------------------------------

    pub fn store(&self) -> Store {
        self.inner.store.read().clone()
    }

    pub fn get_base_dir(&self) -> PathBuf {
        self.store().root_path().to_path_buf()
    }

    /// Switches the store root. The current directory moves to the new root.
    pub fn set_base_dir(&self, path: impl Into<PathBuf>) -> Result<()> {
        let store = Store::open(path.into())?;
        let root = store.root();
        *self.inner.store.write() = store;
        let base = self.get_base_dir();
        tracing::info!(base_dir = ?base, "base directory changed");
        self.inner.events.emit(&ManagerEvent::BaseDirChanged(base));
        self.select_current(root, true)
    }

    pub fn get_current_dir(&self) -> Handle {
        match &*self.inner.current.lock() {
            Some(cur) => cur.handle.clone(),
            None => self.store().root(),
        }
    }

    /// Selects a directory of the current store as the current directory.
    pub fn set_current_dir(&self, dir: &Handle) -> Result<()> {
        if !dir.is_dir() {
            return Err(Error::invalid("manager", format!("{} is not a directory", dir.rel_path())));
        }
        if dir.store_handle().root_path() != self.store().root_path() {
            return Err(Error::invalid(
                "manager",
                format!("{:?} is not inside the base directory", dir.path()),
            ));
        }
        self.select_current(dir.clone(), true)
    }

    fn select_current(&self, handle: Handle, notify: bool) -> Result<()> {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let listener = handle.changes().on(move |change| {
            let Some(inner) = weak.upgrade() else { return };
            let (cause, path) = match change {
                HandleChange::Renamed { new, .. } => (DirChangeCause::Renamed, Some(new.clone())),
                HandleChange::Moved { new, .. } => (DirChangeCause::Moved, Some(new.clone())),
                HandleChange::Parent { new, .. } => (DirChangeCause::Parent, Some(new.clone())),
                HandleChange::Log => (DirChangeCause::Log, None),
                HandleChange::Meta | HandleChange::Children => return,
            };
            let path = match path {
                Some(p) => p,
                None => match &*inner.current.lock() {
                    Some(cur) => cur.handle.rel_path(),
                    None => return,
                },
            };
            inner.events.emit(&ManagerEvent::CurrentDirChanged { path, cause });
        });
        let path = handle.rel_path();
        let previous = self.inner.current.lock().replace(CurrentDir { handle, listener });
        if let Some(prev) = previous {
            prev.handle.changes().off(prev.listener);
        }
        if notify {
            self.inner.events.emit(&ManagerEvent::CurrentDirChanged {
                path,
                cause: DirChangeCause::Selected,
            });
        }
        Ok(())
    }

    // Audit log and results ----------------------------------------------

    /// Appends an entry to the current directory's log.
    pub fn log(&self, message: &str, source: &str, extra: Info) -> Result<()> {
        self.get_current_dir()
            .log(LogEntry::new(message).with_source(source).with_extra(extra))
    }

    /// Records a fatal task error in the current directory's log, tagged `source=task`.
    /// The message is the error kind (`"aborted"`, `"timeout"`, ...).
    pub(crate) fn log_task_error(&self, task: &str, err: &Error) {
        tracing::error!(task, kind = %err.kind(), error = %err, "task failed");
        let mut extra = Info::new();
        extra.insert("name".to_string(), json!(task));
        extra.insert("error".to_string(), json!(err.to_string()));
        if let Err(e) = self.log(err.kind().as_str(), "task", extra) {
            tracing::warn!(error = %e, "could not write task error to the audit log");
        }
    }

    /// Writes `result` into a new auto-incremented `Protocol` directory under the current
    /// directory: one MetaArray file per device, the protocol record in the directory info.
    pub fn store_result(&self, result: &TaskResult) -> Result<Handle> {
        let params = &result.protocol.params;
        let name = params
            .get("protocol")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("task")
            .to_string();
        let mut dir_info = Info::new();
        dir_info.insert(info::DIR_TYPE_KEY.to_string(), json!("Protocol"));
        dir_info.insert("protocol".to_string(), params.clone());
        dir_info.insert("startTime".to_string(), json!(result.protocol.start_time));
        dir_info.insert("status".to_string(), json!(result.protocol.status));

        let dir = self.get_current_dir().mkdir(&name, true, Some(dir_info))?;
        for (device, data) in result.devices.iter() {
            dir.write_file(&FileData::Array(data.to_metaarray()), device, WriteOptions::default())?;
        }
        tracing::info!(dir = %dir.rel_path(), devices = result.devices.len(), "stored task result");
        Ok(dir)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimShutter;

    fn manager() -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(ManagerConfig::new(dir.path())).unwrap();
        (dir, manager)
    }

    #[test]
    fn registry() {
        let (_dir, m) = manager();
        m.add_device(Arc::new(SimShutter::new("shutter"))).unwrap();
        assert!(m.add_device(Arc::new(SimShutter::new("shutter"))).is_err());
        assert_eq!(m.get_device("shutter").unwrap().name(), "shutter");
        assert_eq!(m.get_device("nope").err().unwrap().kind(), acq_backend::ErrorKind::UnknownDevice);
        assert_eq!(m.device_names(), vec!["shutter"]);
    }

    #[test]
    fn current_dir_notifications() {
        let (_dir, m) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.events().on(move |ev| s.lock().push(ev.clone()));

        let root = m.get_current_dir();
        let a = root.mkdir("a", false, None).unwrap();
        let b = a.mkdir("b", false, None).unwrap();
        m.set_current_dir(&b).unwrap();
        a.rename("a2").unwrap();
        m.log("hello", "user", Info::new()).unwrap();
        b.rename("b2").unwrap();

        let causes: Vec<(String, DirChangeCause)> = seen
            .lock()
            .iter()
            .filter_map(|ev| match ev {
                ManagerEvent::CurrentDirChanged { path, cause } => Some((path.clone(), *cause)),
                _ => None,
            })
            .collect();
        assert_eq!(
            causes,
            vec![
                ("a/b".to_string(), DirChangeCause::Selected),
                ("a2/b".to_string(), DirChangeCause::Parent),
                ("a2/b".to_string(), DirChangeCause::Log),
                ("a2/b2".to_string(), DirChangeCause::Renamed),
            ]
        );
        assert_eq!(m.get_current_dir().rel_path(), "a2/b2");
    }

    #[test]
    fn base_dir_change() {
        let (_dir, m) = manager();
        let other = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.events().on(move |ev| s.lock().push(ev.clone()));
        m.set_base_dir(other.path()).unwrap();
        assert_eq!(m.get_base_dir(), std::fs::canonicalize(other.path()).unwrap());
        assert!(matches!(seen.lock()[0], ManagerEvent::BaseDirChanged(_)));
        assert_eq!(m.get_current_dir().rel_path(), "");
    }

    #[test]
    fn missing_preset() {
        let (_dir, m) = manager();
        assert_eq!(m.preset("nothing").unwrap_err().kind(), acq_backend::ErrorKind::NotFound);
        assert!(m.preset_names().is_empty());
    }
}
