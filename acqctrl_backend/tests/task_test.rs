use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use acq_backend::clock;
use acq_backend::store::FileData;
use acq_backend::{
    parse_params, ConfigureContext, Device, DeviceCore, DeviceResult, DeviceState, DeviceTask, ErrorKind,
    Requirements, Result, StartTrigger, TaskDescription, TaskStatus,
};
use acqctrl_backend::sim::{CellModel, SimClamp, SimDaq, SimShutter};
use acqctrl_backend::{Manager, ManagerConfig, TaskState};

struct Rig {
    _dir: tempfile::TempDir,
    manager: Manager,
    daq: Arc<SimDaq>,
    clamp: Arc<SimClamp>,
    shutter: Arc<SimShutter>,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let config = ManagerConfig {
        reserve_timeout: 5.,
        timeout_margin: 2.,
        ..ManagerConfig::new(dir.path())
    };
    let manager = Manager::new(config).unwrap();
    let daq = Arc::new(SimDaq::new("daq", 10e3).with_input("ai0", 0.5));
    let clamp = Arc::new(SimClamp::new("clamp_A", "daq", CellModel::default()));
    let shutter = Arc::new(SimShutter::new("shutter"));
    manager.add_device(daq.clone()).unwrap();
    manager.add_device(clamp.clone()).unwrap();
    manager.add_device(shutter.clone()).unwrap();
    Rig {
        _dir: dir,
        manager,
        daq,
        clamp,
        shutter,
    }
}

fn recording(duration: f64) -> TaskDescription {
    TaskDescription::new(duration)
        .with_name("recording")
        .with_device("daq", json!({"rate": 10e3, "downsample": 2, "ai": ["ai0"]}))
        .with_device("clamp_A", json!({"mode": "VC", "holding": -0.065}))
        .with_device("shutter", json!({}))
}

/// Unclocked device that records how many tasks hold it at once.
struct Recorder {
    core: DeviceCore,
    holders: Arc<AtomicUsize>,
    max_holders: AtomicUsize,
    runs: AtomicUsize,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RecorderParams {
    hold: f64,
    stall: bool,
}

impl Recorder {
    fn new(name: &str) -> Self {
        Self {
            core: DeviceCore::new(name),
            holders: Arc::new(AtomicUsize::new(0)),
            max_holders: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }
}

impl Device for Recorder {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn requirements(&self, params: &Value) -> Result<Requirements> {
        let p: RecorderParams = parse_params(self.name(), params)?;
        Ok(Requirements {
            min_duration: p.hold,
            ..Requirements::unclocked()
        })
    }

    fn configure(&self, params: &Value, ctx: &ConfigureContext) -> Result<Box<dyn DeviceTask>> {
        let p: RecorderParams = parse_params(self.name(), params)?;
        let now = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecorderTask {
            holders: self.holders.clone(),
            duration: ctx.duration,
            stall: p.stall,
            started: None,
        }))
    }
}

struct RecorderTask {
    holders: Arc<AtomicUsize>,
    duration: f64,
    stall: bool,
    started: Option<Instant>,
}

impl DeviceTask for RecorderTask {
    fn start(&mut self, trigger: &StartTrigger) -> Result<()> {
        self.started = Some(trigger.scheduled());
        Ok(())
    }

    fn is_done(&mut self) -> Result<bool> {
        let elapsed = self.started.map_or(0., |s| s.elapsed().as_secs_f64());
        Ok(!self.stall && elapsed >= self.duration)
    }

    fn stop(&mut self, _abort: bool) -> Result<()> {
        Ok(())
    }

    fn result(self: Box<Self>) -> Result<DeviceResult> {
        Ok(DeviceResult::empty(self.started.map_or_else(clock::now, clock::to_epoch)))
    }
}

impl Drop for RecorderTask {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

fn task_log(rig: &Rig) -> Vec<(String, Option<String>)> {
    rig.manager
        .get_current_dir()
        .read_log(false)
        .unwrap()
        .into_iter()
        .map(|e| (e.message, e.source))
        .collect()
}

#[test]
fn synchronized_recording() {
    let rig = rig();
    let mut task = rig.manager.create_task(recording(0.2)).unwrap();
    assert_eq!(task.master(), Some("daq"));
    assert_eq!(task.config_order(), &["daq", "clamp_A", "shutter"]);

    let result = task.run().unwrap();
    assert_eq!(task.state(), TaskState::Released);
    assert!(result.is_complete());
    assert_eq!(result["daq"].num_samples(), 1000);
    assert_eq!(result["daq"].channel("ai0").unwrap()[10], 0.5);
    assert_eq!(result["clamp_A"].num_samples(), 1000);
    assert_eq!(result["clamp_A"].downsample, 2);
    assert_eq!(result["clamp_A"].start_time, result["daq"].start_time);
    assert_eq!(result["shutter"].num_samples(), 0);
    assert_eq!(result.protocol.params["protocol"]["duration"], json!(0.2));

    for device in [rig.daq.state(), rig.clamp.state(), rig.shutter.state()] {
        assert_eq!(device, DeviceState::Idle);
    }
    assert!(!rig.shutter.is_open());
}

#[test]
fn stepwise_lifecycle() {
    let rig = rig();
    let mut task = rig.manager.create_task(recording(0.05)).unwrap();
    assert!(task.configure().is_err());
    task.reserve_devices().unwrap();
    assert_eq!(task.state(), TaskState::Reserved);
    assert_eq!(rig.clamp.core().lock().holder().as_deref(), Some("recording"));
    task.configure().unwrap();
    assert_eq!(rig.clamp.state(), DeviceState::Configured);
    task.execute(false).unwrap();
    assert_eq!(task.state(), TaskState::Running);
    task.wait().unwrap();
    let result = task.get_result().unwrap();
    assert_eq!(task.state(), TaskState::Result);
    assert_eq!(result["clamp_A"].num_samples(), 250);
    task.release_devices();
    task.release_devices();
    assert!(rig.clamp.core().lock().holder().is_none());
}

#[test]
fn zero_duration_gives_empty_arrays() {
    let rig = rig();
    let mut task = rig.manager.create_task(recording(0.)).unwrap();
    let result = task.run().unwrap();
    assert_eq!(result.protocol.status, TaskStatus::Completed);
    for r in result.devices.values() {
        assert_eq!(r.num_samples(), 0);
    }
    assert_eq!(result["daq"].channels.len(), 1);
}

#[test]
fn lead_time_delays_first_sample() {
    let rig = rig();
    let mut desc = recording(0.05);
    desc.protocol.lead_time = 0.2;
    let before = clock::now();
    let result = rig.manager.create_task(desc).unwrap().run().unwrap();
    assert!(result.protocol.start_time >= before + 0.19);
    assert_eq!(result["daq"].num_samples(), 250);
}

#[test]
fn shutter_hold_extends_duration() {
    let rig = rig();
    let desc = recording(0.05).with_device("shutter", json!({"hold": 0.1}));
    let task = rig.manager.create_task(desc).unwrap();
    assert_eq!(task.duration(), 0.1);
}

#[test]
fn missing_daq_partner_rejected_before_reservation() {
    let rig = rig();
    let desc = TaskDescription::new(0.1).with_device("clamp_A", json!({"mode": "VC"}));
    let err = rig.manager.create_task(desc).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    assert!(rig.clamp.core().lock().holder().is_none());
    assert_eq!(rig.clamp.state(), DeviceState::Idle);
}

#[test]
fn rejects_bad_descriptions() {
    let rig = rig();
    rig.manager.add_device(Arc::new(SimDaq::new("daq2", 10e3))).unwrap();

    let two_masters = TaskDescription::new(0.1)
        .with_device("daq", json!({}))
        .with_device("daq2", json!({}));
    let unknown = TaskDescription::new(0.1).with_device("laser", json!({}));
    let bad_params = TaskDescription::new(0.1).with_device("daq", json!({"rate": "fast"}));
    let wrong_daq = TaskDescription::new(0.1)
        .with_device("daq", json!({}))
        .with_device("clamp_A", json!({"daq": "daq2"}));

    let kind = |d: TaskDescription| rig.manager.create_task(d).err().unwrap().kind();
    assert_eq!(kind(two_masters), ErrorKind::InvalidParams);
    assert_eq!(kind(unknown), ErrorKind::UnknownDevice);
    assert_eq!(kind(bad_params), ErrorKind::InvalidParams);
    assert_eq!(kind(wrong_daq), ErrorKind::InvalidParams);

    let endless = TaskDescription::new(1e20).with_device("shutter", json!({}));
    let mut late = TaskDescription::new(0.1).with_device("shutter", json!({}));
    late.protocol.lead_time = f64::INFINITY;
    let mut negative = TaskDescription::new(-0.1).with_device("shutter", json!({}));
    negative.protocol.timeout_margin = Some(1.);
    assert_eq!(kind(endless), ErrorKind::InvalidParams);
    assert_eq!(kind(late), ErrorKind::InvalidParams);
    assert_eq!(kind(negative), ErrorKind::InvalidParams);
}

#[test]
fn abort_all_stops_running_task() {
    let rig = rig();
    let mut task = rig.manager.create_task(recording(5.)).unwrap();
    let manager = rig.manager.clone();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1000));
        manager.abort_all()
    });

    let started = Instant::now();
    let err = task.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(aborter.join().unwrap());

    let partial = task.partial_result().unwrap();
    assert_eq!(partial.protocol.status, TaskStatus::Aborted);
    let clamp = &partial["clamp_A"];
    assert!(clamp.incomplete);
    assert!(clamp.num_samples() > 0 && clamp.num_samples() < clamp.expected_samples);

    for state in [rig.daq.state(), rig.clamp.state(), rig.shutter.state()] {
        assert_eq!(state, DeviceState::Idle);
    }
    assert!(!rig.shutter.is_open());
    assert!(rig.shutter.abort_count() >= 1);
    assert_eq!(rig.manager.active_tasks(), 0);
    let aborted = task_log(&rig)
        .into_iter()
        .filter(|entry| *entry == ("aborted".to_string(), Some("task".to_string())))
        .count();
    assert_eq!(aborted, 1);
}

#[test]
fn abort_handle_stops_one_task() {
    let rig = rig();
    let mut task = rig.manager.create_task(recording(5.)).unwrap();
    let handle = task.abort_handle();
    task.reserve_devices().unwrap();
    task.configure().unwrap();
    task.execute(false).unwrap();
    handle.abort();
    assert_eq!(task.wait().unwrap_err().kind(), ErrorKind::Aborted);
    assert_eq!(task.state(), TaskState::Released);
}

#[test]
fn device_failure_releases_everything() {
    let rig = rig();
    rig.clamp.fail_on_poll(true);
    let mut task = rig.manager.create_task(recording(0.5)).unwrap();
    let err = task.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFailure);
    assert!(rig.daq.core().lock().holder().is_none());
    assert!(rig.clamp.core().lock().holder().is_none());
    assert!(!rig.shutter.is_open());
    assert!(task_log(&rig).contains(&("device_failure".to_string(), Some("task".to_string()))));

    rig.clamp.fail_on_poll(false);
    rig.daq.fail_on_start(true);
    let err = rig.manager.create_task(recording(0.5)).unwrap().run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceFailure);
    rig.daq.fail_on_start(false);
    assert!(rig.manager.create_task(recording(0.05)).unwrap().run().is_ok());
}

#[test]
fn stalled_device_times_out() {
    let rig = rig();
    rig.manager.add_device(Arc::new(Recorder::new("recorder"))).unwrap();
    let mut desc = TaskDescription::new(0.05).with_device("recorder", json!({"stall": true}));
    desc.protocol.timeout_margin = Some(0.2);
    let started = Instant::now();
    let err = rig.manager.create_task(desc).unwrap().run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(task_log(&rig).contains(&("timeout".to_string(), Some("task".to_string()))));
}

#[test]
fn contended_reservation_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = ManagerConfig {
        reserve_timeout: 0.2,
        ..ManagerConfig::new(dir.path())
    };
    let manager = Manager::new(config).unwrap();
    manager.add_device(Arc::new(Recorder::new("recorder"))).unwrap();
    let desc = || TaskDescription::new(0.05).with_device("recorder", json!({}));

    let mut first = manager.create_task(desc()).unwrap();
    first.reserve_devices().unwrap();
    let mut second = manager.create_task(desc()).unwrap();
    let err = second.reserve_devices().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contended);
    assert_eq!(second.state(), TaskState::Created);

    first.release_devices();
    second.reserve_devices().unwrap();
}

#[test]
fn overlapping_tasks_never_share_devices() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::new(dir.path())).unwrap();
    let recorders: Vec<Arc<Recorder>> = ["p0", "p1", "p2", "p3"].iter().map(|n| Arc::new(Recorder::new(n))).collect();
    for p in recorders.iter() {
        manager.add_device(p.clone()).unwrap();
    }

    // Opposite listing orders on a shared device.
    let t1 = TaskDescription::new(0.1)
        .with_name("t1")
        .with_device("p1", json!({}))
        .with_device("p0", json!({}));
    let t2 = TaskDescription::new(0.1)
        .with_name("t2")
        .with_device("p0", json!({}))
        .with_device("p2", json!({}));
    let handles: Vec<_> = [t1, t2]
        .into_iter()
        .map(|d| {
            let m = manager.clone();
            thread::spawn(move || m.create_task(d).unwrap().run().map(|r| r.protocol.status))
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap().unwrap(), TaskStatus::Completed);
    }

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let m = manager.clone();
            thread::spawn(move || {
                for i in 0..5 {
                    let mut desc = TaskDescription::new(0.02).with_name(&format!("w{}_{}", w, i));
                    for k in 0..3 {
                        desc = desc.with_device(&format!("p{}", (w + i + k) % 4), json!({}));
                    }
                    m.create_task(desc).unwrap().run().unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    for p in recorders.iter() {
        assert_eq!(p.max_holders.load(Ordering::SeqCst), 1, "{}", p.name());
        assert_eq!(p.holders.load(Ordering::SeqCst), 0);
        assert!(p.core().lock().holder().is_none());
    }
    let runs: usize = recorders.iter().map(|p| p.runs.load(Ordering::SeqCst)).sum();
    assert_eq!(runs, 4 + 4 * 5 * 3);
}

#[test]
fn stored_result_reads_back() {
    let rig = rig();
    let cell = rig.manager.get_current_dir().mkdir("cell", true, None).unwrap();
    rig.manager.set_current_dir(&cell).unwrap();

    let mut desc = recording(0.05);
    desc.protocol.store_data = true;
    rig.manager.create_task(desc).unwrap().run().unwrap();

    let dirs = cell.subdirs(acq_backend::SortMode::Name).unwrap();
    assert_eq!(dirs.len(), 1);
    let protocol = &dirs[0];
    assert_eq!(protocol.name(), "recording_000");
    let info = protocol.info().unwrap();
    assert_eq!(info["dirType"], json!("Protocol"));
    assert_eq!(info["status"], json!("completed"));
    assert_eq!(info["protocol"]["protocol"]["name"], json!("recording"));

    let file = protocol.child("clamp_A.ma").unwrap();
    let FileData::Array(ma) = file.read_file().unwrap() else {
        panic!("expected an array");
    };
    let back = DeviceResult::from_metaarray(&ma).unwrap();
    assert_eq!(back.num_samples(), 250);
    assert_eq!(back.channel_names(), vec!["primary", "command"]);
}

#[test]
fn presets_create_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let presets = tempfile::tempdir().unwrap();
    std::fs::write(
        presets.path().join("shutter_only.json"),
        r#"{"protocol": {"duration": 0.01, "name": "flash"}, "shutter": {"open": true}}"#,
    )
    .unwrap();
    let config = ManagerConfig {
        config_dir: Some(presets.path().to_path_buf()),
        ..ManagerConfig::new(dir.path())
    };
    let manager = Manager::new(config).unwrap();
    manager.add_device(Arc::new(SimShutter::new("shutter"))).unwrap();
    assert_eq!(manager.preset_names(), vec!["shutter_only"]);
    let desc = manager.preset("shutter_only").unwrap();
    let result = manager.create_task(desc).unwrap().run().unwrap();
    assert!(result.is_complete());
    assert_eq!(result.protocol.params["protocol"]["name"], json!("flash"));
}
