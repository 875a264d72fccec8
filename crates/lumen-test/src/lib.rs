//! Test harness for the Lumen submission core.
//!
//! Drives complete frames (acquire, compute, render, present, transient
//! resource cleanup) against the headless device.

pub mod harness;

pub use harness::{FrameHarness, FrameReport, HarnessConfig, HeadlessSwapchain, RunStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] lumen_gpu::GpuError),
    #[error("Invalid harness configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TestError>;
