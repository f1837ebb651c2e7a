//! Control-client abstraction consumed by the orchestrator.
//!
//! The orchestrator never holds a concrete socket; it asks a connector for a
//! client per operation and always disconnects on every exit path. Tests
//! substitute both traits without a hypervisor.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use infinivirt_core::error::VmError;

use crate::qmp::{QmpClient, QmpEvent, QmpOptions};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait ControlClient: Send + Sync {
    fn query_status(&self) -> BoxFuture<'_, Result<String, VmError>>;
    fn system_powerdown(&self) -> BoxFuture<'_, Result<(), VmError>>;
    /// Pause vCPUs (protocol verb `stop`).
    fn pause(&self) -> BoxFuture<'_, Result<(), VmError>>;
    /// Resume vCPUs (protocol verb `cont`).
    fn resume(&self) -> BoxFuture<'_, Result<(), VmError>>;
    fn system_reset(&self) -> BoxFuture<'_, Result<(), VmError>>;
    fn query_balloon(&self) -> BoxFuture<'_, Result<u64, VmError>>;
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QmpEvent>>;
    fn disconnect(&self);
}

pub trait ControlConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        socket: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn ControlClient>, VmError>>;
}

impl ControlClient for QmpClient {
    fn query_status(&self) -> BoxFuture<'_, Result<String, VmError>> {
        Box::pin(QmpClient::query_status(self))
    }

    fn system_powerdown(&self) -> BoxFuture<'_, Result<(), VmError>> {
        Box::pin(QmpClient::system_powerdown(self))
    }

    fn pause(&self) -> BoxFuture<'_, Result<(), VmError>> {
        Box::pin(QmpClient::stop(self))
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), VmError>> {
        Box::pin(QmpClient::cont(self))
    }

    fn system_reset(&self) -> BoxFuture<'_, Result<(), VmError>> {
        Box::pin(QmpClient::system_reset(self))
    }

    fn query_balloon(&self) -> BoxFuture<'_, Result<u64, VmError>> {
        Box::pin(QmpClient::query_balloon(self))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<QmpEvent>> {
        QmpClient::take_events(self)
    }

    fn disconnect(&self) {
        QmpClient::disconnect(self)
    }
}

/// Production connector: real QMP over the VM's Unix socket.
#[derive(Default)]
pub struct QmpConnector {
    pub options: QmpOptions,
}

impl ControlConnector for QmpConnector {
    fn connect<'a>(
        &'a self,
        socket: &'a Path,
    ) -> BoxFuture<'a, Result<Arc<dyn ControlClient>, VmError>> {
        Box::pin(async move {
            let client = QmpClient::connect(socket, self.options.clone()).await?;
            Ok(Arc::new(client) as Arc<dyn ControlClient>)
        })
    }
}
