// This file is part of StreamVault, a live-stream recording supervisor.

pub mod clock;
mod error;
pub mod ids;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{prettify_failure, Error, ErrorKind, ResultExt};
pub use parking_lot::{Condvar, Mutex};
