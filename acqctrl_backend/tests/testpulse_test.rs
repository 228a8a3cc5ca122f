use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use serde_json::json;

use acq_backend::{ClampDevice, ClampMode, Device, DeviceState, ErrorKind};
use acqctrl_backend::sim::{CellModel, SimClamp, SimDaq};
use acqctrl_backend::{
    Manager, ManagerConfig, RetryPolicy, TestPulseAnalysis, TestPulseEvent, TestPulseResult, TestPulseRunner,
};

struct Rig {
    _dir: tempfile::TempDir,
    manager: Manager,
    clamp: Arc<SimClamp>,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(ManagerConfig::new(dir.path())).unwrap();
    let clamp = Arc::new(SimClamp::new("clamp_A", "daq", CellModel::default()));
    manager.add_device(Arc::new(SimDaq::new("daq", 500e3))).unwrap();
    manager.add_device(clamp.clone()).unwrap();
    Rig {
        _dir: dir,
        manager,
        clamp,
    }
}

fn listen(runner: &TestPulseRunner) -> channel::Receiver<TestPulseEvent> {
    let (tx, rx) = channel::unbounded();
    runner.events().on(move |ev| {
        let _ = tx.send(ev.clone());
    });
    rx
}

#[test]
fn voltage_clamp_pulse() {
    let rig = rig();
    rig.clamp.set_holding(ClampMode::VC, -0.065).unwrap();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner
        .set_parameters(json!({
            "mode": "VC",
            "sample_rate": 500000.0,
            "downsample": 20,
            "pre_duration": 0.005,
            "pulse_duration": 0.010,
            "post_duration": 0.005,
            "amplitude": -0.010,
            "average_count": 1,
        }))
        .unwrap();

    let (analysis, pulse) = runner.run_once().unwrap();
    assert_eq!(pulse.primary.len(), 500);
    assert_eq!(pulse.rate, 25e3);
    assert!(analysis.steady_state_resistance.unwrap() > 0.);
    assert!(analysis.input_resistance.unwrap() > 0.);
    assert!((analysis.baseline_potential.unwrap() + 0.065).abs() < 1e-6);
    assert_eq!(rig.clamp.state(), DeviceState::Idle);
}

#[test]
fn averaging_keeps_one_segment() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_parameters(json!({"mode": "VC", "average_count": 3})).unwrap();
    let (analysis, pulse) = runner.run_once().unwrap();
    assert_eq!(pulse.primary.len(), 500);
    let rss = analysis.steady_state_resistance.unwrap();
    assert!((rss - 210e6).abs() / 210e6 < 0.05, "{}", rss);
}

#[test]
fn parameter_versions() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    let (v0, _) = runner.parameters();
    let v1 = runner.set_parameters(json!({"amplitude": -0.005})).unwrap();
    assert!(v1 > v0);
    let err = runner.set_parameters(json!({"sample_rate": 1000.0})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    let (v, params) = runner.parameters();
    assert_eq!(v, v1);
    assert_eq!(params.amplitude, -0.005);
    assert_eq!(params.sample_rate, 500e3);
    let v2 = runner.update_parameters(|p| p.average_count = 2).unwrap();
    assert!(v2 > v1);
}

#[test]
fn rejects_non_clamp_devices() {
    let rig = rig();
    let err = TestPulseRunner::new(rig.manager.clone(), "daq").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidParams);
    let err = TestPulseRunner::new(rig.manager.clone(), "clamp_B").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnknownDevice);
}

#[test]
fn auto_bias_converges_in_current_clamp() {
    let rig = rig();
    rig.clamp.set_mode(ClampMode::IC).unwrap();
    rig.clamp.set_holding(ClampMode::IC, 0.).unwrap();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner
        .set_parameters(json!({
            "mode": "IC",
            "amplitude": -10e-12,
            "auto_bias": {"enabled": true, "target": -0.070, "follow_rate": 0.5},
        }))
        .unwrap();
    let events = listen(&runner);
    runner.start().unwrap();
    assert!(runner.is_running());

    let mut potentials = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while potentials.len() < 20 && Instant::now() < deadline {
        match events.recv_timeout(Duration::from_secs(5)) {
            Ok(TestPulseEvent::PulseFinished { device, analysis, .. }) => {
                assert_eq!(device, "clamp_A");
                potentials.push(analysis.baseline_potential.unwrap());
            }
            Ok(TestPulseEvent::Failed { error, .. }) => panic!("runner failed: {}", error),
            Err(_) => break,
        }
    }
    runner.stop(true).unwrap();
    assert!(!runner.is_running());

    let first_close = potentials.iter().position(|v| (v + 0.070).abs() < 1e-3);
    assert!(first_close.is_some(), "{:?}", potentials);
    let errors: Vec<f64> = potentials.iter().map(|v| (v + 0.070).abs()).collect();
    for pair in errors.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6, "{:?}", errors);
    }
    assert!(rig.clamp.holding(ClampMode::IC) < 0.);
}

#[test]
fn voltage_clamp_carries_bias_over() {
    let rig = rig();
    // Holding away from rest draws a steady current.
    rig.clamp.set_holding(ClampMode::VC, -0.075).unwrap();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner
        .set_parameters(json!({"mode": "VC", "auto_bias": {"enabled": true, "vc_carryover": 1.0}}))
        .unwrap();
    let (analysis, _) = runner.run_once().unwrap();
    let baseline = analysis.baseline_current.unwrap();
    assert!((baseline - (-0.010 / 210e6)).abs() < 1e-13);
    assert!((rig.clamp.holding(ClampMode::IC) - baseline).abs() < 1e-18);
}

#[test]
fn carried_bias_respects_current_limits() {
    let rig = rig();
    rig.clamp.set_holding(ClampMode::VC, -0.075).unwrap();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner
        .set_parameters(json!({
            "mode": "VC",
            "auto_bias": {"enabled": true, "vc_carryover": 1.0, "min_current": -1e-11, "max_current": 1e-11}
        }))
        .unwrap();
    let (analysis, _) = runner.run_once().unwrap();
    assert!(analysis.baseline_current.unwrap() < -1e-11);
    assert_eq!(rig.clamp.holding(ClampMode::IC), -1e-11);
}

#[test]
fn post_processing_amends_analysis() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_parameters(json!({"mode": "VC"})).unwrap();
    runner.set_post_processing(Some(Arc::new(|pulse: &TestPulseResult, analysis: &mut TestPulseAnalysis| {
        analysis.time_constant = Some(pulse.primary.len() as f64);
    })));
    let (analysis, _) = runner.run_once().unwrap();
    assert_eq!(analysis.time_constant, Some(500.));
}

#[test]
fn repeated_failures_stop_the_runner() {
    let rig = rig();
    rig.clamp.fail_on_start(true);
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_retry_policy(RetryPolicy {
        retry_delay: Duration::from_millis(20),
        max_failures: 3,
    });
    let events = listen(&runner);
    runner.start().unwrap();
    match events.recv_timeout(Duration::from_secs(10)).unwrap() {
        TestPulseEvent::Failed { device, error } => {
            assert_eq!(device, "clamp_A");
            assert!(error.contains("simulated start failure"), "{}", error);
        }
        other => panic!("unexpected event {:?}", other),
    }
    runner.stop(true).unwrap();
    assert!(!runner.is_running());
    assert!(rig.clamp.core().lock().holder().is_none());
}

#[test]
fn abort_all_stops_the_runner() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_parameters(json!({"mode": "VC", "interval": 0.05})).unwrap();
    let events = listen(&runner);
    runner.start().unwrap();
    events.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(rig.manager.abort_all());
    let deadline = Instant::now() + Duration::from_secs(5);
    while runner.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!runner.is_running());
    runner.stop(true).unwrap();
    assert!(rig.clamp.core().lock().holder().is_none());
}

#[test]
fn restart_after_stop() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_parameters(json!({"mode": "VC", "interval": 0.02})).unwrap();
    let events = listen(&runner);
    for _ in 0..2 {
        while events.try_recv().is_ok() {}
        runner.start().unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)).unwrap(),
            TestPulseEvent::PulseFinished { .. }
        ));
        runner.stop(true).unwrap();
        assert!(!runner.is_running());
    }
}

#[test]
fn start_right_after_nonblocking_stop() {
    let rig = rig();
    let runner = TestPulseRunner::new(rig.manager.clone(), "clamp_A").unwrap();
    runner.set_parameters(json!({"mode": "VC", "interval": 0.02})).unwrap();
    let events = listen(&runner);
    runner.start().unwrap();
    events.recv_timeout(Duration::from_secs(5)).unwrap();

    runner.stop(false).unwrap();
    runner.start().unwrap();
    assert!(runner.is_running());
    while events.try_recv().is_ok() {}
    std::thread::sleep(Duration::from_millis(300));
    assert!(runner.is_running());
    assert!(matches!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        TestPulseEvent::PulseFinished { .. }
    ));
    runner.stop(true).unwrap();
    assert!(!runner.is_running());
}
