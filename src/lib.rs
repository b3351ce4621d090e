//! geoprint: map print dispatch service.
//!
//! Print jobs are filtered against the requester's authorized topics, rendered
//! by a local print engine or a remote print service, optionally rasterized,
//! and exposed as short-lived artifacts.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
