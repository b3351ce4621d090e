//! Application services: the print pipeline and its seams.

pub mod backend;
pub mod conversion;
pub mod error;
pub mod filter;
pub mod print;
pub mod topics;
