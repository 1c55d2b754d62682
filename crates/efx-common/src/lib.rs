//! ---
//! efx_section: "01-core-functionality"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Shared primitives and utilities for the exporter runtime."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
//! Core shared primitives for the EcoFlow exporter workspace.
//! This crate exposes configuration loading, logging setup, and the
//! telemetry value tree consumed across the workspace.

pub mod config;
pub mod logging;
pub mod value;

pub use config::{
    ConfigError, Credentials, DeviceTableConfig, ExporterConfig, ExporterEndpointConfig,
    LoggingConfig, NameSource, TimingConfig, TransportKind,
};
pub use logging::{init_tracing, LogFormat};
pub use value::QuotaValue;
