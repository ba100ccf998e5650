#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod code;
pub mod config;
pub mod core;
pub mod entity;
pub mod environment;
pub mod error;
pub mod file;
pub mod logging;
pub mod output;
pub mod project;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod task;
