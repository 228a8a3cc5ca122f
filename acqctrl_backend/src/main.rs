use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use acq_backend::clock::TickTimer;
use acq_backend::error::Result;
use acqctrl_backend::sim::{CellModel, SimClamp, SimDaq, SimShutter};
use acqctrl_backend::{Manager, ManagerConfig, TestPulseRunner};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base_dir = std::env::args().nth(1).unwrap_or_else(|| "acq_data".to_string());
    if let Err(e) = run(&base_dir) {
        tracing::error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}

fn run(base_dir: &str) -> Result<()> {
    let manager = Manager::new(ManagerConfig::new(base_dir))?;
    manager.add_device(Arc::new(SimDaq::new("daq", 100e3).with_input("ai0", 0.25)))?;
    manager.add_device(Arc::new(SimClamp::new("clamp_A", "daq", CellModel::default())))?;
    manager.add_device(Arc::new(SimShutter::new("shutter")))?;

    let mut timer = TickTimer::new();
    let mut task = manager.create_task_from_value(json!({
        "protocol": {"name": "demo", "duration": 0.5},
        "daq": {"rate": 100e3, "downsample": 10, "ai": ["ai0"]},
        "clamp_A": {"mode": "VC", "holding": -0.065},
        "shutter": {"open": true},
    }))?;
    let result = task.run()?;
    timer.tick_print("demo task");
    for (name, r) in result.devices.iter() {
        tracing::info!(device = %name, samples = r.num_samples(), rate = ?r.rate, "result");
    }
    let stored = manager.store_result(&result)?;
    tracing::info!(dir = %stored.rel_path(), "stored");

    let runner = TestPulseRunner::new(manager.clone(), "clamp_A")?;
    runner.set_parameters(json!({"mode": "VC", "amplitude": -0.010, "average_count": 2}))?;
    for _ in 0..3 {
        let (analysis, _) = runner.run_once()?;
        tracing::info!(
            ra = ?analysis.access_resistance,
            rin = ?analysis.input_resistance,
            tau = ?analysis.time_constant,
            "test pulse"
        );
    }
    timer.tick_print("test pulses");
    Ok(())
}
