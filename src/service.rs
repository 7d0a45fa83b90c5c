use crate::{
    inverter::{InverterError, InverterReader},
    registers::{RegisterValue, ACTIVE_POWER},
};
use serde_derive::Serialize;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info};

pub const ACTIVE_POWER_UNIT: &str = "Watt";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePower {
    pub active_power: RegisterValue,
    pub unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    #[error("inverter connection is not initialised")]
    Uninitialized,
    #[error("could not establish inverter connection: {0}")]
    StartupFatal(#[source] InverterError),
    #[error("inverter connection is already established")]
    AlreadyStarted,
    #[error(transparent)]
    Inverter(#[from] InverterError),
}

/// Answers read requests through the one shared inverter connection.
///
/// The connection slot starts empty; [`InverterQueryService::start`] fills it exactly once and
/// reads fail with [`ServiceError::Uninitialized`] until then.
pub struct InverterQueryService {
    handle: OnceCell<Arc<dyn InverterReader>>,
    slave_id: u8,
}

impl InverterQueryService {
    pub fn new(slave_id: u8) -> Self {
        Self {
            handle: OnceCell::new(),
            slave_id,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.handle.initialized()
    }

    /// Runs the connection factory and stores its handle.
    ///
    /// Concurrent callers wait for the first one; the factory of a caller that finds the
    /// handle already set is never run.
    pub async fn start<F, Fut>(&self, connect: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn InverterReader>, InverterError>>,
    {
        let ran = AtomicBool::new(false);
        self.handle
            .get_or_try_init(|| {
                ran.store(true, Ordering::Relaxed);
                async move {
                    connect().await.map_err(|err| {
                        error!("Inverter startup failed: {err}");
                        ServiceError::StartupFatal(err)
                    })
                }
            })
            .await?;
        if !ran.load(Ordering::Relaxed) {
            return Err(ServiceError::AlreadyStarted);
        }
        info!("Inverter connection ready (slave id {})", self.slave_id);
        Ok(())
    }

    pub async fn read_active_power(&self) -> Result<ActivePower, ServiceError> {
        let handle = self.handle.get().ok_or(ServiceError::Uninitialized)?;
        let value = handle.read(ACTIVE_POWER, self.slave_id).await?;
        Ok(ActivePower {
            active_power: value,
            unit: ACTIVE_POWER_UNIT,
        })
    }
}
