//! linkwall library
//!
//! Named media slots behind short public links. Media arrives by upload,
//! remote URL or a path under a configured root, is validated and
//! normalised, and is stored next to a JSON metadata file.

pub mod cli;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod media;
pub mod server;
pub mod store;
