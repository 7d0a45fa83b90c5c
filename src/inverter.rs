//! Modbus TCP session to a Huawei inverter
//!
//! [`establish`] opens the connection once at startup. The resulting [`InverterSession`] keeps
//! its transport behind a mutex, so concurrent readers queue up and at most one request/response
//! exchange is ever on the wire. Failed reads are never retried; an exchange that ends without a
//! complete reply costs the connection, and the next read opens a new one.

use crate::registers::{self, RegisterValue};
use async_trait::async_trait;
use std::{net::SocketAddr, time::Duration};
use thiserror::Error;
use tokio::{net::lookup_host, sync::Mutex, time::timeout};
use tokio_modbus::{client::Context, prelude::*};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InverterError {
    /// The device could not be reached or did not answer in time
    #[error("communication with inverter failed: {0}")]
    Communication(String),
    /// The reply could not be understood
    #[error("malformed reply from inverter: {0}")]
    Protocol(String),
    /// The device answered with a Modbus exception
    #[error("inverter rejected the request: {0}")]
    Device(String),
    #[error("unknown register `{0}`")]
    UnknownRegister(String),
}

/// Raw register access against a connected device
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, InverterError>;
}

/// Named register reads, as consumed by the query service
#[async_trait]
pub trait InverterReader: Send + Sync {
    async fn read(&self, register: &str, slave_id: u8) -> Result<RegisterValue, InverterError>;
}

/// tokio-modbus client with a per-exchange timeout.
///
/// The context is only kept after an exchange that got a complete reply. A timed out,
/// cancelled or garbled exchange drops the socket along with any late frame still in it, and
/// the next exchange starts on a fresh connection.
pub struct ModbusTransport {
    socket_addr: SocketAddr,
    context: Option<Context>,
    timeout: Duration,
}

impl ModbusTransport {
    pub async fn connect(socket_addr: SocketAddr, timeout: Duration) -> Result<Self, InverterError> {
        let context = open(socket_addr, timeout).await?;
        Ok(Self {
            socket_addr,
            context: Some(context),
            timeout,
        })
    }
}

async fn open(socket_addr: SocketAddr, connect_timeout: Duration) -> Result<Context, InverterError> {
    timeout(connect_timeout, tcp::connect(socket_addr))
        .await
        .map_err(|_| {
            InverterError::Communication(format!(
                "connecting to {socket_addr} timed out after {}ms",
                connect_timeout.as_millis()
            ))
        })?
        .map_err(|err| InverterError::Communication(format!("connecting to {socket_addr}: {err}")))
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, InverterError> {
        let mut context = match self.context.take() {
            Some(context) => context,
            None => {
                info!(
                    "Reopening connection to inverter at {} after an unfinished exchange",
                    self.socket_addr
                );
                open(self.socket_addr, self.timeout).await?
            }
        };

        context.set_slave(Slave(slave_id));
        let reply = timeout(self.timeout, context.read_holding_registers(address, count))
            .await
            .map_err(|_| {
                InverterError::Communication(format!(
                    "no reply within {}ms",
                    self.timeout.as_millis()
                ))
            })?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let words = match reply {
            Ok(Ok(words)) => words,
            Ok(Err(exception)) => {
                self.context = Some(context);
                return Err(InverterError::Device(format!(
                    "Modbus exception {exception:?} reading {count} registers at {address}"
                )));
            }
            Err(tokio_modbus::Error::Transport(err)) => {
                return Err(InverterError::Communication(err.to_string()))
            }
            Err(err) => return Err(InverterError::Protocol(err.to_string())),
        };
        self.context = Some(context);

        if words.len() != usize::from(count) {
            return Err(InverterError::Protocol(format!(
                "asked for {count} registers at {address}, got {}",
                words.len()
            )));
        }
        Ok(words)
    }
}

/// The single logical session to the inverter
pub struct InverterSession {
    peer: String,
    transport: Mutex<Box<dyn RegisterTransport>>,
}

impl InverterSession {
    pub fn new(peer: impl Into<String>, transport: Box<dyn RegisterTransport>) -> Self {
        Self {
            peer: peer.into(),
            transport: Mutex::new(transport),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl InverterReader for InverterSession {
    async fn read(&self, register: &str, slave_id: u8) -> Result<RegisterValue, InverterError> {
        let register = registers::lookup(register)
            .ok_or_else(|| InverterError::UnknownRegister(register.to_string()))?;

        let words = {
            let mut transport = self.transport.lock().await;
            transport
                .read_holding_registers(slave_id, register.address, register.word_count())
                .await
        };
        let words = words.map_err(|err| {
            warn!(peer = %self.peer, register = register.name, slave_id, error = %err, "register read failed");
            err
        })?;

        let value = register.decode(&words)?;
        debug!(
            peer = %self.peer,
            register = register.name,
            slave_id,
            ?value,
            unit = register.unit,
            "register read ok"
        );
        Ok(value)
    }
}

/// Opens the Modbus TCP connection to the inverter
pub async fn establish(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<InverterSession, InverterError> {
    let peer = format!("{host}:{port}");
    let socket_addr = resolve(host, port).await?;

    info!("Connecting to inverter at {peer} ({socket_addr})");
    let transport = ModbusTransport::connect(socket_addr, connect_timeout).await?;
    info!("Connected to inverter at {peer}");

    Ok(InverterSession::new(peer, Box::new(transport)))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, InverterError> {
    lookup_host((host, port))
        .await
        .map_err(|err| InverterError::Communication(format!("resolving {host}: {err}")))?
        .next()
        .ok_or_else(|| InverterError::Communication(format!("{host} did not resolve")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::ACTIVE_POWER;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::{net::TcpListener, task::JoinSet};

    /// Transport that records how many exchanges overlap
    struct InstrumentedTransport {
        words: Vec<u16>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RegisterTransport for InstrumentedTransport {
        async fn read_holding_registers(
            &mut self,
            _slave_id: u8,
            _address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, InverterError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.words.clone())
        }
    }

    /// Transport that always fails with the given error and remembers the request
    struct FailingTransport {
        error: InverterError,
        last_request: Arc<std::sync::Mutex<Option<(u8, u16, u16)>>>,
    }

    #[async_trait]
    impl RegisterTransport for FailingTransport {
        async fn read_holding_registers(
            &mut self,
            slave_id: u8,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, InverterError> {
            *self.last_request.lock().unwrap() = Some((slave_id, address, count));
            Err(self.error.clone())
        }
    }

    #[tokio::test]
    async fn test_concurrent_reads_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(InverterSession::new(
            "mock",
            Box::new(InstrumentedTransport {
                words: vec![0, 2500],
                in_flight: in_flight.clone(),
                max_in_flight: max_in_flight.clone(),
                calls: calls.clone(),
            }),
        ));

        let mut reads = JoinSet::new();
        for _ in 0..16 {
            let session = session.clone();
            reads.spawn(async move { session.read(ACTIVE_POWER, 0).await });
        }
        while let Some(result) = reads.join_next().await {
            assert_eq!(result.unwrap().unwrap(), RegisterValue::Integer(2500));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 16);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_addresses_register_and_slave() {
        let last_request = Arc::new(std::sync::Mutex::new(None));
        let session = InverterSession::new(
            "mock",
            Box::new(FailingTransport {
                error: InverterError::Device("IllegalDataAddress".into()),
                last_request: last_request.clone(),
            }),
        );

        let err = session.read(ACTIVE_POWER, 1).await.unwrap_err();
        assert!(matches!(err, InverterError::Device(_)));
        assert_eq!(*last_request.lock().unwrap(), Some((1, 32080, 2)));
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        for error in [
            InverterError::Communication("timed out".into()),
            InverterError::Protocol("bad header".into()),
            InverterError::Device("ServerDeviceFailure".into()),
        ] {
            let session = InverterSession::new(
                "mock",
                Box::new(FailingTransport {
                    error: error.clone(),
                    last_request: Default::default(),
                }),
            );
            assert_eq!(session.read(ACTIVE_POWER, 0).await.unwrap_err(), error);
        }
    }

    #[tokio::test]
    async fn test_guard_released_after_failure() {
        let last_request = Arc::new(std::sync::Mutex::new(None));
        let session = InverterSession::new(
            "mock",
            Box::new(FailingTransport {
                error: InverterError::Communication("timed out".into()),
                last_request: last_request.clone(),
            }),
        );
        assert!(session.read(ACTIVE_POWER, 0).await.is_err());
        // A second read would deadlock if the first left the guard held
        let second = tokio::time::timeout(Duration::from_secs(1), session.read(ACTIVE_POWER, 0))
            .await
            .expect("guard was not released");
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_unknown_register_is_rejected_before_transport() {
        let last_request = Arc::new(std::sync::Mutex::new(None));
        let session = InverterSession::new(
            "mock",
            Box::new(FailingTransport {
                error: InverterError::Communication("unused".into()),
                last_request: last_request.clone(),
            }),
        );
        let err = session.read("battery_power", 0).await.unwrap_err();
        assert_eq!(err, InverterError::UnknownRegister("battery_power".into()));
        assert!(last_request.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_reply_is_protocol_error() {
        let session = InverterSession::new(
            "mock",
            Box::new(InstrumentedTransport {
                words: vec![7],
                in_flight: Default::default(),
                max_in_flight: Default::default(),
                calls: Default::default(),
            }),
        );
        let err = session.read(ACTIVE_POWER, 0).await.unwrap_err();
        assert!(matches!(err, InverterError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_establish_refused_connection() {
        // Grab a free port then close it again so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = establish("127.0.0.1", addr.port(), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(InverterError::Communication(_))));
    }

    #[tokio::test]
    async fn test_establish_sets_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let session = establish("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(session.peer(), format!("127.0.0.1:{}", addr.port()));
    }
}
