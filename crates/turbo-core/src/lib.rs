#![allow(clippy::too_many_arguments, clippy::type_complexity)]

pub mod config;
pub mod engine;
pub mod events;
pub mod plan;
pub mod transport;
pub mod types;
