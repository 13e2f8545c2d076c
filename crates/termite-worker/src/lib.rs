//! Worker runtime: serves mirror sessions for masters, executes their jobs
//! in a materialized view of the master's writable root, and ships the
//! produced files back as file sets.

mod config;
mod error;
mod mirror;
mod view;
mod worker;

pub use config::WorkerOptions;
pub use error::{Result, WorkerError};
pub use mirror::WorkerMirror;
pub use worker::Worker;
