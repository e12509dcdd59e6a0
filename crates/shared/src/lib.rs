//! Wire types shared between the BMC services and their callers.
pub mod message;
pub mod power;
pub mod subject;
