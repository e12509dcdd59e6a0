//! Connections to I²C-family slave devices over `/dev/i2c-<N>`.
//!
//! Capability-negotiated raw transfers, combined read/write transactions,
//! the SMBus command set, PMBus numeric formats, and I³C scaffolding.
mod config;
mod conn;
mod error;
pub mod i3c;
pub(crate) mod ioctl;
pub mod pmbus;
mod smbus;

pub use config::{AddressMode, Coefficients, Config, PmbusFormat, Protocol};
pub use conn::Connection;
pub use error::Error;
pub use ioctl::Funcs;
