#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod cursor;
pub mod data;
pub mod engine;
pub mod model;
pub mod rest;
pub mod store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
pub use engine::{ActionError, Dispatch, Engine, Options};
pub use store::ThreadState;
