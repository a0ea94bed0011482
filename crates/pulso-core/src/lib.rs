//! Core domain model, error taxonomy and configuration for pulso.

pub mod config;
pub mod error;
pub mod feed;
pub mod model;

pub use config::AppConfig;
pub use error::{CoreError, CoreResult};

pub const CRATE_NAME: &str = "pulso-core";
