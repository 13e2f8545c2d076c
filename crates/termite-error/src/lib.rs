//! Common error types shared across Termite crates.

mod common;

pub use common::CommonError;
