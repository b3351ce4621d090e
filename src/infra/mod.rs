//! Infrastructure adapters and runtime bootstrap.

pub mod artifacts;
pub mod backend;
pub mod error;
pub mod http;
pub mod process;
pub mod rasterizer;
pub mod remote;
pub mod renderer;
pub mod telemetry;
