//! # awskit
//!
//! Command-line front-end over [`awskit_core`] and [`awskit_aws`].
//!
//! - **cli**: argument parsing and translation into operation requests
//! - **app**: configuration layering and dispatcher wiring
//! - **render**: human/JSON output and exit codes
//! - **logging**: tracing subscriber setup

pub mod app;
pub mod cli;
pub mod logging;
pub mod render;

pub use awskit_aws;
pub use awskit_core;
