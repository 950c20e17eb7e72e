//! Single-in-flight GATT operation queue
//!
//! The platform accepts one outstanding GATT operation per device. Every
//! read, write, descriptor write, MTU request and service discovery goes
//! through this queue: a worker task takes jobs in submission order and does
//! not start the next one until the current one completed, failed or timed
//! out.
//!
//! ```text
//!  caller ──submit──▶ [ job | job | job ] ──▶ worker ──▶ BleTransport
//!    ▲                                           │
//!    └──────────── oneshot result ◀──────────────┘
//! ```

use crate::error::{SessionError, TransportError};
use crate::infrastructure::bluetooth::transport::{BleTransport, GattService};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Invoked when an operation exceeds its deadline, before the slot is released.
pub type TimeoutHandler = Box<dyn FnOnce() + Send>;

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    DiscoverServices,
    Read(Uuid),
    Write { uuid: Uuid, len: usize },
    SetNotification { uuid: Uuid, enabled: bool },
    RequestMtu(usize),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::DiscoverServices => write!(f, "discover services"),
            Operation::Read(uuid) => write!(f, "read {uuid}"),
            Operation::Write { uuid, len } => write!(f, "write {len} bytes to {uuid}"),
            Operation::SetNotification { uuid, enabled: true } => {
                write!(f, "enable notifications on {uuid}")
            }
            Operation::SetNotification { uuid, enabled: false } => {
                write!(f, "disable notifications on {uuid}")
            }
            Operation::RequestMtu(mtu) => write!(f, "request MTU {mtu}"),
        }
    }
}

pub struct OperationQueue {
    address: String,
    transport: Arc<dyn BleTransport>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    /// Starts the worker. Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        let address = transport.address().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run_worker(address.clone(), receiver));
        Self {
            address,
            transport,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(address: String, mut receiver: mpsc::UnboundedReceiver<Job>) {
        debug!(%address, "Operation queue started");
        while let Some(job) = receiver.recv().await {
            job.await;
        }
        debug!(%address, "Operation queue drained");
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .map(|sender| sender.is_some())
            .unwrap_or(false)
    }

    /// Cancels the operation in flight and every queued one. Their callers
    /// receive [`SessionError::Cancelled`].
    pub fn stop(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                debug!(address = %self.address, "Stopping operation queue");
                worker.abort();
            }
        }
    }

    /// Queues `run` and waits for its result.
    ///
    /// The returned future resolves exactly once: with the transport result,
    /// with [`SessionError::TransportTimeout`] after `timeout`, or with
    /// [`SessionError::Cancelled`] when the queue is stopped first. A job whose
    /// caller went away before it reached the head of the queue is skipped.
    pub async fn submit<T, F, Fut>(
        &self,
        operation: Operation,
        timeout: Duration,
        on_timeout: Option<TimeoutHandler>,
        run: F,
    ) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BleTransport>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let transport = self.transport.clone();
        let address = self.address.clone();
        let label = operation.to_string();

        let job = async move {
            if result_tx.is_closed() {
                trace!(%address, operation = %label, "Skipping abandoned operation");
                return;
            }
            trace!(%address, operation = %label, "Dispatching operation");
            let result = match time::timeout(timeout, run(transport)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => {
                    debug!(%address, operation = %label, error = %source, "Operation failed");
                    Err(SessionError::TransportFailure {
                        operation: label,
                        source,
                    })
                }
                Err(_) => {
                    warn!(%address, operation = %label, ?timeout, "Operation timed out");
                    if let Some(handler) = on_timeout {
                        handler();
                    }
                    Err(SessionError::TransportTimeout { operation: label })
                }
            };
            let _ = result_tx.send(result);
        }
        .boxed();

        let queued = self
            .sender
            .lock()
            .ok()
            .and_then(|sender| sender.as_ref().map(|sender| sender.send(job).is_ok()))
            .unwrap_or(false);
        if !queued {
            return Err(SessionError::Cancelled(operation.to_string()));
        }

        result_rx
            .await
            .map_err(|_| SessionError::Cancelled(operation.to_string()))?
    }

    pub async fn discover_services(
        &self,
        timeout: Duration,
        on_timeout: Option<TimeoutHandler>,
    ) -> Result<Vec<GattService>, SessionError> {
        self.submit(Operation::DiscoverServices, timeout, on_timeout, |transport| async move {
            transport.discover_services().await
        })
        .await
    }

    pub async fn read(&self, uuid: Uuid, timeout: Duration) -> Result<Vec<u8>, SessionError> {
        self.submit(Operation::Read(uuid), timeout, None, move |transport| async move {
            transport.read_characteristic(uuid).await
        })
        .await
    }

    pub async fn write(
        &self,
        uuid: Uuid,
        value: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let operation = Operation::Write {
            uuid,
            len: value.len(),
        };
        self.submit(operation, timeout, None, move |transport| async move {
            transport.write_characteristic(uuid, &value).await
        })
        .await
    }

    pub async fn set_notification(
        &self,
        uuid: Uuid,
        enabled: bool,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let operation = Operation::SetNotification { uuid, enabled };
        self.submit(operation, timeout, None, move |transport| async move {
            transport.set_notification(uuid, enabled).await
        })
        .await
    }

    /// Returns the MTU granted by the peer.
    pub async fn request_mtu(&self, mtu: usize, timeout: Duration) -> Result<usize, SessionError> {
        self.submit(Operation::RequestMtu(mtu), timeout, None, move |transport| async move {
            transport.request_mtu(mtu).await
        })
        .await
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
