pub mod backup;
pub mod common;
pub mod completions;
pub mod config;
pub mod device;
pub mod entity;
pub mod queue;
pub mod sync;
