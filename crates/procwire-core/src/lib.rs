//! procwire core - platform-independent process supervision
//!
//! This crate provides the handle state machine, deferred stdio streams,
//! runner traits, configuration and error types shared by the platform
//! runners.

mod config;
mod error;
mod exit;
mod handle;
mod holder;
mod runner;
mod status;
mod streams;
mod watcher;

pub use config::*;
pub use error::*;
pub use exit::*;
pub use handle::*;
pub use holder::*;
pub use runner::*;
pub use status::*;
pub use streams::*;
pub use watcher::*;
