pub mod alignment;
pub mod camera;
pub mod config;
pub mod control;
pub mod monitor;
pub mod pose;
pub mod protocol;
pub mod relay;
pub mod renderer;
pub mod runtime;
