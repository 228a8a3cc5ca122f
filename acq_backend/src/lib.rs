//! Data model of the acquisition engine: device contracts, task descriptions and results,
//! waveforms, and the hierarchical on-disk store.

pub mod clock;
pub mod description;
pub mod device;
pub mod error;
pub mod events;
pub mod result;
pub mod store;
pub mod utils;
pub mod waveform;

pub use description::*;
pub use device::*;
pub use error::{Error, ErrorKind, Result};
pub use result::*;
pub use store::{FileData, Handle, HandleChange, SortMode, Store, WriteOptions};
pub use waveform::*;
