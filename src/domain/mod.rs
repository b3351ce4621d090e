pub mod artifact;
pub mod job;

pub use geoprint_api_types::OutputFormat;
