//! Runtime of the acquisition engine.
//!
//! A [`Manager`] holds the device registry, the data store and the current directory.
//! Tasks created from it reserve, configure, start and collect a set of devices as one
//! synchronized acquisition; [`TestPulseRunner`]s run periodic test pulses on patch-clamp
//! channels in the background. [`AbortBus`] stops everything in flight.
//!
//! The [`sim`] module provides simulated DAQ, amplifier and shutter devices.

pub mod abort;
pub mod config;
pub mod manager;
pub mod sim;
pub mod task;
pub mod testpulse;
pub mod worker_cmd_chan;

pub use abort::{AbortBus, AbortSubscription};
pub use config::{load_presets, HostEventTick, ManagerConfig};
pub use manager::{DirChangeCause, Manager, ManagerEvent};
pub use task::{AbortHandle, Task, TaskState};
pub use testpulse::{
    AutoBias, PostProcess, RetryPolicy, TestPulseAnalysis, TestPulseEvent, TestPulseParams, TestPulseResult,
    TestPulseRunner,
};
