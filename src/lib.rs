pub mod aggregate;
pub mod archive;
pub mod config;
pub mod delay;
pub mod error;
pub mod geo;
pub mod output;
pub mod pipeline;
pub mod schedule;
pub mod speed;
pub mod trace;
