//! Master runtime: worker discovery, mirror sessions, job dispatch, and
//! file-set replay into the writable root.

mod config;
mod error;
mod fileserver;
mod master;
mod mirror;
mod pool;
mod replay;
mod waiter;

pub use config::MasterOptions;
pub use error::{MasterError, Result};
pub use fileserver::FileServer;
pub use master::Master;
pub use mirror::MirrorConnection;
pub use pool::{MirrorConnector, MirrorPool, PoolOptions};
pub use replay::{apply_file_set, replay_file_set};
pub use waiter::{FileSetWaiter, Subscription};
