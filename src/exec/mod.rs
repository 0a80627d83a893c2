//! Execution backends.
//!
//! The coordinator only knows the `Executor` contract from `crate::model`;
//! this module holds the concrete backends. `local` runs rule applications
//! as child processes on this host.

mod local;

pub use local::LocalExecutor;
