//! Huawei Solar Active Power API
//!
//! This library exposes the active power reading of a Huawei SUN2000 inverter over HTTP,
//! reading it on demand through one shared Modbus TCP session.

pub mod config;
pub mod http;
pub mod inverter;
pub mod registers;
pub mod service;

// Re-export commonly used types for easier access
pub use config::{Config, InverterConfig};
pub use inverter::{establish, InverterError, InverterReader, InverterSession};
pub use registers::RegisterValue;
pub use service::{ActivePower, InverterQueryService, ServiceError};

use anyhow::Context;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;

/// Connects to the inverter, then serves HTTP until shutdown.
///
/// The listener is only bound once `connect` succeeded; a failed connection ends the process
/// before any request can be accepted.
pub async fn run<F, Fut>(config: Config, connect: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<dyn InverterReader>, InverterError>>,
{
    let service = Arc::new(InverterQueryService::new(config.inverter.slave_id));
    service
        .start(connect)
        .await
        .context("inverter startup failed")?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    http::serve(listener, service).await
}
