//! USB composite gadgets over configfs, plus HID report writers.
//!
//! A gadget is composed under `/sys/kernel/config/usb_gadget/<name>/`,
//! bound to a UDC by name, and driven through `/dev/hidg<N>`.
mod config;
mod error;
mod gadget;
pub mod hid;
mod storage;

pub use config::{GadgetConfig, LunConfig};
pub use error::Error;
pub use gadget::{GadgetManager, GadgetStatus};
pub use storage::LunState;
