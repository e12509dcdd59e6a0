//! GPIO line management over the kernel character device (uAPI v2).
//!
//! A [`Manager`] opens chips once and hands out [`Line`] handles with
//! synchronous value operations, asynchronous edge events, and timed
//! primitives (toggle, pulse, hold, blink).
mod chip;
mod error;
mod flasher;
mod group;
mod line;
mod manager;
mod monitor;
mod options;
pub(crate) mod uapi;

pub use chip::{ChipInfo, LineInfo};
pub use error::Error;
pub use flasher::Flasher;
pub use group::LineGroup;
pub use line::{EdgeKind, Event, EventStream, Line, LineState};
pub use manager::Manager;
pub use monitor::LineMonitor;
pub use options::{
    Active, Bias, BlinkPattern, Defaults, Direction, Drive, Edge, LineOptions,
};
