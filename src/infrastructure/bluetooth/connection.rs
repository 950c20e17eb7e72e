//! BLE Connection Module
//!
//! One [`ConnectionSession`] per physical device. It owns the device's
//! operation queue and connection state, brings the link up
//! (discover, bind, negotiate MTU), keeps subscription counts, and routes
//! notifications to the dispatcher and to pending command responses.

use crate::domain::features::registry::FeatureRegistry;
use crate::domain::features::{Feature, FeatureClass, FeatureCommand, FeatureResponse, FeatureUpdate};
use crate::domain::models::{ChunkProgress, ConnectionState, DeviceIdentity, StateTransition};
use crate::domain::settings::{NotificationRelease, SessionConfig};
use crate::error::{RegistryError, SessionError};
use crate::infrastructure::bluetooth::commands::{self, CommandLink, CommandTarget, RetryPolicy};
use crate::infrastructure::bluetooth::dispatcher::{
    BindingTable, CharacteristicBinding, NotificationDispatcher, RawNotification, UpdateReceiver,
};
use crate::infrastructure::bluetooth::protocol::{self, CONFIG_CONTROL_UUID};
use crate::infrastructure::bluetooth::queue::{OperationQueue, TimeoutHandler};
use crate::infrastructure::bluetooth::service::{BoardCatalog, FirmwareInfo};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use crate::infrastructure::bluetooth::update_log::LoggerSink;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<FeatureRegistry>,
    pub config: SessionConfig,
    pub sink: LoggerSink,
    pub catalog: Option<Arc<dyn BoardCatalog>>,
}

impl SessionContext {
    /// Default registry and configuration with a tracing update logger.
    /// Must be called from within a Tokio runtime.
    pub fn with_defaults() -> Self {
        let config = SessionConfig::default();
        Self {
            registry: Arc::new(FeatureRegistry::with_defaults()),
            sink: LoggerSink::with_tracing(config.log_channel_capacity),
            config,
            catalog: None,
        }
    }
}

struct SessionInner {
    address: String,
    identity: DeviceIdentity,
    transport: Arc<dyn BleTransport>,
    context: SessionContext,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    transition_lock: Mutex<()>,
    /// Bumped by every teardown; a connect or pump from an older link is stale
    generation: AtomicU64,
    queue: Mutex<Option<Arc<OperationQueue>>>,
    dispatcher: NotificationDispatcher,
    raw: broadcast::Sender<RawNotification>,
    max_payload: AtomicUsize,
    chunk_progress: watch::Sender<ChunkProgress>,
    /// Serializes subscription count changes with the notification writes they cause
    subscription_gate: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    firmware: Mutex<Option<FirmwareInfo>>,
}

/// Connection to one board.
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl ConnectionSession {
    pub fn new(transport: Arc<dyn BleTransport>, identity: DeviceIdentity, context: SessionContext) -> Self {
        let address = transport.address().to_string();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(16);
        let (raw, _) = broadcast::channel(context.config.notification_buffer);
        let (chunk_progress, _) = watch::channel(ChunkProgress::default());
        let dispatcher = NotificationDispatcher::new(
            &address,
            context.sink.clone(),
            context.config.notification_buffer,
        );

        Self {
            inner: Arc::new(SessionInner {
                address,
                identity,
                transport,
                context,
                state,
                transitions,
                transition_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                queue: Mutex::new(None),
                dispatcher,
                raw,
                max_payload: AtomicUsize::new(protocol::DEFAULT_PAYLOAD_SIZE),
                chunk_progress,
                subscription_gate: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                firmware: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every accepted transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    /// Starts connecting and returns the state stream.
    ///
    /// Calling it again while connecting or connected does nothing and
    /// returns the same stream. The session reaches Ready on its own; a
    /// failed discovery or MTU negotiation drives it back to Disconnected.
    /// A [`disconnect`](Self::disconnect) before the link comes up fails the
    /// call with [`SessionError::Cancelled`].
    pub async fn connect(&self) -> Result<watch::Receiver<ConnectionState>, SessionError> {
        let inner = &self.inner;
        let current = inner.state();
        if current.is_active() {
            debug!(address = %inner.address, state = ?current, "Already connecting or connected");
            return Ok(self.states());
        }
        let generation = inner.generation.load(Ordering::SeqCst);
        if !inner.transition(ConnectionState::Connecting) {
            return Ok(self.states());
        }

        info!(address = %inner.address, name = %inner.identity.name, "Connecting to device");
        inner.lookup_firmware();

        let events = match inner.transport.connect().await {
            Ok(events) => events,
            Err(source) => {
                error!(address = %inner.address, error = %source, "Connection failed");
                if inner.is_current(generation) {
                    inner.transition(ConnectionState::Disconnected);
                }
                return Err(SessionError::TransportFailure {
                    operation: "connect".to_string(),
                    source,
                });
            }
        };

        let installed = {
            let mut queue = inner.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let current = inner.is_current(generation);
            if current {
                *queue = Some(Arc::new(OperationQueue::new(inner.transport.clone())));
            }
            current
        };
        if !installed {
            drop(events);
            // a newer connect owns the transport when the session is active again
            if !inner.state().is_active() {
                info!(address = %inner.address, "Disconnected while connecting, dropping link");
                inner.disconnect_transport();
            }
            return Err(SessionError::Cancelled("connect".to_string()));
        }
        inner.spawn(SessionInner::pump(inner.clone(), generation, events));
        Ok(self.states())
    }

    /// Waits until the session is in `target`.
    ///
    /// Fails with [`SessionError::Cancelled`] when the session falls back to
    /// Disconnected first, and with [`SessionError::TransportTimeout`] after
    /// `timeout`.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> Result<(), SessionError> {
        let mut states = self.states();
        let operation = format!("waiting for {target:?}");
        let reached = time::timeout(
            timeout,
            states.wait_for(|state| *state == target || *state == ConnectionState::Disconnected),
        )
        .await
        .map_err(|_| SessionError::TransportTimeout {
            operation: operation.clone(),
        })?
        .map(|state| *state == target)
        .map_err(|_| SessionError::Cancelled(operation.clone()))?;

        if reached {
            Ok(())
        } else {
            Err(SessionError::Cancelled(operation))
        }
    }

    /// Features bound on this connection, in discovery order.
    pub fn features(&self) -> Vec<Arc<Feature>> {
        self.inner.dispatcher.table().features()
    }

    pub fn feature(&self, name: &str) -> Option<Arc<Feature>> {
        self.features().into_iter().find(|feature| feature.name() == name)
    }

    /// Bits and identifiers that could not be bound during the last discovery.
    pub fn binding_errors(&self) -> Vec<RegistryError> {
        self.inner.dispatcher.table().errors().to_vec()
    }

    /// False for standard features a protocol v1 board left out of its
    /// advertised mask.
    pub fn is_enabled(&self, feature: &Feature) -> bool {
        self.inner.dispatcher.table().is_enabled(feature.id())
    }

    /// Enables notifications for `features`.
    ///
    /// Returns `Ok(false)` when at least one characteristic could not be
    /// enabled; the others stay subscribed. Disabled features and features
    /// that only carry commands are skipped.
    pub async fn subscribe(&self, features: &[Arc<Feature>]) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let _gate = inner.subscription_gate.lock().await;
        let queue = inner.queue_for("subscribe")?;
        let table = inner.dispatcher.table();

        let mut all = true;
        for feature in features {
            if !table.is_enabled(feature.id()) || !feature.is_data_notify() {
                warn!(address = %inner.address, feature = %feature, "Feature cannot be subscribed");
                all = false;
                continue;
            }
            let bindings: Vec<_> = table.bindings_for(feature.id()).cloned().collect();
            if bindings.is_empty() {
                warn!(address = %inner.address, feature = %feature, "Feature is not bound");
                all = false;
            }
            for binding in bindings {
                if !inner.enable(&queue, &binding).await? {
                    all = false;
                    continue;
                }
                binding.update_subscription(|state| state.add_feature(feature.id()));
            }
        }
        Ok(all)
    }

    /// Drops one subscription per feature, disabling notifications on
    /// characteristics left without subscribers.
    pub async fn unsubscribe(&self, features: &[Arc<Feature>]) -> Result<bool, SessionError> {
        let inner = &self.inner;
        let _gate = inner.subscription_gate.lock().await;
        let queue = inner.queue_for("unsubscribe")?;
        let table = inner.dispatcher.table();

        let mut all = true;
        for feature in features {
            for binding in table.bindings_for(feature.id()) {
                if !binding.update_subscription(|state| state.remove_feature(feature.id())) {
                    continue;
                }
                if !inner.release(&queue, binding).await? {
                    all = false;
                }
            }
        }
        Ok(all)
    }

    /// Updates for `features` decoded from notifications.
    pub fn updates(&self, features: &[Arc<Feature>]) -> UpdateReceiver {
        self.inner.dispatcher.updates(features)
    }

    /// Every notification as received, before decoding.
    pub fn notifications(&self) -> broadcast::Receiver<RawNotification> {
        self.inner.raw.subscribe()
    }

    /// [`read_feature`](Self::read_feature) with the configured read timeout.
    pub async fn read(&self, feature: &Feature) -> Result<Vec<FeatureUpdate>, SessionError> {
        self.read_feature(feature, self.inner.context.config.read_timeout)
            .await
    }

    /// Reads the characteristic carrying `feature` and decodes it.
    ///
    /// Empty when the feature is not bound to a readable characteristic.
    pub async fn read_feature(
        &self,
        feature: &Feature,
        timeout: Duration,
    ) -> Result<Vec<FeatureUpdate>, SessionError> {
        let inner = &self.inner;
        let queue = inner.queue_for("read")?;
        let Some(binding) = inner
            .dispatcher
            .table()
            .bindings_for(feature.id())
            .filter(|binding| binding.characteristic.properties.can_read())
            .max_by_key(|binding| binding.features.len())
            .cloned()
        else {
            debug!(address = %inner.address, feature = %feature, "Feature is not readable");
            return Ok(Vec::new());
        };

        let value = queue.read(binding.uuid(), timeout).await?;
        Ok(inner
            .dispatcher
            .decode(&binding, &value)
            .into_iter()
            .filter(|update| update.feature == feature.id())
            .collect())
    }

    /// Sends a command and waits up to `response_timeout` for the answer.
    ///
    /// Failed writes are retried up to `retry` times, `retry_delay` apart,
    /// within the configured retry budget. See [`commands::send_command`]
    /// for the meaning of each outcome.
    pub async fn write_command(
        &self,
        command: &FeatureCommand,
        response_timeout: Duration,
        retry: usize,
        retry_delay: Duration,
    ) -> Result<Option<FeatureResponse>, SessionError> {
        let policy = RetryPolicy {
            retries: retry,
            delay: retry_delay,
            budget: self.inner.context.config.retry_budget,
        };
        commands::send_command(&*self.inner, command, response_timeout, policy).await
    }

    pub fn max_payload(&self) -> usize {
        self.inner.max_payload.load(Ordering::SeqCst)
    }

    pub fn chunk_progress(&self) -> watch::Receiver<ChunkProgress> {
        self.inner.chunk_progress.subscribe()
    }

    /// Current subscriber count of `feature`, over all its characteristics.
    pub fn subscriber_count(&self, feature: &Feature) -> usize {
        self.inner
            .dispatcher
            .table()
            .bindings_for(feature.id())
            .map(|binding| binding.subscription().feature_subscribers(feature.id()))
            .sum()
    }

    /// Whether notifications are on for the characteristic `uuid`.
    pub fn is_notifying(&self, uuid: Uuid) -> bool {
        self.inner
            .dispatcher
            .table()
            .get(uuid)
            .is_some_and(|binding| binding.subscription().enabled)
    }

    /// Board catalog entry found when connecting.
    pub fn firmware_info(&self) -> Option<FirmwareInfo> {
        self.inner.firmware.lock().ok()?.clone()
    }

    /// Tears the session down. Pending operations and response waits are
    /// cancelled, bindings are cleared and the state is Disconnected when
    /// this returns; the transport disconnect completes in the background.
    pub fn disconnect(&self) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        info!(address = %self.inner.address, "Disconnecting");
        self.inner.shutdown();
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.inner.abort_tasks();
        self.inner.stop_queue();
    }
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Applies `next` when the transition graph allows it.
    fn transition(&self, next: ConnectionState) -> bool {
        let _order = self.transition_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut previous = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(previous) => {
                debug!(address = %self.address, ?previous, current = ?next, "State changed");
                let _ = self.transitions.send(StateTransition {
                    previous,
                    current: next,
                });
                true
            }
            None => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for task in tasks {
            task.abort();
        }
    }

    fn stop_queue(&self) {
        if let Some(queue) = self.queue.lock().ok().and_then(|mut queue| queue.take()) {
            queue.stop();
        }
    }

    /// The queue, if the link is up.
    fn queue_for(&self, operation: &str) -> Result<Arc<OperationQueue>, SessionError> {
        if !self.state().is_connected() {
            return Err(SessionError::not_connected(operation));
        }
        self.queue
            .lock()
            .ok()
            .and_then(|queue| queue.clone())
            .ok_or_else(|| SessionError::not_connected(operation))
    }

    fn lookup_firmware(&self) {
        let Some(catalog) = &self.context.catalog else {
            return;
        };
        let Some(firmware_id) = self.identity.firmware_id() else {
            debug!(address = %self.address, "No firmware id advertised");
            return;
        };
        let info = catalog.lookup(self.identity.device_id, firmware_id);
        match &info {
            Some(info) => info!(
                address = %self.address,
                board = %info.board_name,
                firmware = %info.firmware_name,
                version = %info.firmware_version,
                "Board catalog match"
            ),
            None => debug!(
                address = %self.address,
                device_id = self.identity.device_id,
                firmware_id,
                "Board not in catalog"
            ),
        }
        if let Ok(mut firmware) = self.firmware.lock() {
            *firmware = info;
        }
    }

    async fn pump(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                debug!(address = %self.address, "Dropping events of a closed link");
                return;
            }
            match event {
                TransportEvent::ConnectionChanged(true) => {
                    if self.transition(ConnectionState::Connected) {
                        info!(address = %self.address, "Link established");
                        self.spawn(self.clone().bring_up());
                    }
                }
                TransportEvent::ConnectionChanged(false) => {
                    if self.state() != ConnectionState::Disconnected {
                        warn!(address = %self.address, "Link lost");
                        self.teardown();
                    }
                }
                TransportEvent::ServicesChanged => {
                    if matches!(
                        self.state(),
                        ConnectionState::ServicesDiscovered | ConnectionState::Ready
                    ) {
                        info!(address = %self.address, "Services changed, rediscovering");
                        self.spawn(self.clone().rediscover());
                    }
                }
                TransportEvent::CharacteristicChanged { uuid, value } => {
                    self.dispatcher.dispatch(uuid, &value);
                    let _ = self.raw.send(RawNotification { uuid, value });
                }
            }
        }
        if self.is_current(generation) && self.state().is_active() {
            warn!(address = %self.address, "Transport event stream ended");
            self.teardown();
        }
    }

    async fn bring_up(self: Arc<Self>) {
        if let Err(e) = self.try_bring_up().await {
            error!(address = %self.address, error = %e, "Bring-up failed");
            self.shutdown();
        }
    }

    async fn try_bring_up(&self) -> Result<(), SessionError> {
        let config = &self.context.config;
        let queue = self.queue_for("bring-up")?;

        // Step 1: Discover services; a stuck discovery takes the link down
        let transport = self.transport.clone();
        let on_timeout: TimeoutHandler = Box::new(move || {
            tokio::spawn(async move {
                let _ = transport.disconnect().await;
            });
        });
        let services = queue
            .discover_services(config.discovery_timeout, Some(on_timeout))
            .await?;

        // Step 2: Bind characteristics to features before anyone can see ServicesDiscovered
        let table = BindingTable::build(
            &services,
            &self.context.registry,
            self.identity.board_model,
            self.identity.feature_mask(),
        );
        info!(
            address = %self.address,
            characteristics = table.len(),
            features = table.features().len(),
            errors = table.errors().len(),
            "Services discovered"
        );
        self.dispatcher.replace_table(table);
        if !self.transition(ConnectionState::ServicesDiscovered) {
            return Err(SessionError::Cancelled("bring-up".to_string()));
        }

        // Step 3: Negotiate the MTU
        let requested = protocol::requested_mtu(config.max_payload_size);
        let granted = queue.request_mtu(requested, config.mtu_timeout).await?;
        let ceiling = config.max_payload_size.max(protocol::DEFAULT_PAYLOAD_SIZE);
        let payload = protocol::payload_for_mtu(granted).min(ceiling);
        self.max_payload.store(payload, Ordering::SeqCst);
        debug!(address = %self.address, requested, granted, payload, "MTU negotiated");

        // Step 4: Ready
        if !self.transition(ConnectionState::Ready) {
            return Err(SessionError::Cancelled("bring-up".to_string()));
        }
        info!(address = %self.address, "Session ready");
        Ok(())
    }

    async fn rediscover(self: Arc<Self>) {
        let _gate = self.subscription_gate.lock().await;
        if let Err(e) = self.try_rediscover().await {
            warn!(address = %self.address, error = %e, "Rediscovery failed");
            if self.state().is_connected() {
                self.shutdown();
            }
        }
    }

    async fn try_rediscover(&self) -> Result<(), SessionError> {
        let queue = self.queue_for("rediscover")?;
        let services = queue
            .discover_services(self.context.config.discovery_timeout, None)
            .await?;
        let table = BindingTable::build(
            &services,
            &self.context.registry,
            self.identity.board_model,
            self.identity.feature_mask(),
        );
        table.carry_over(&self.dispatcher.table());
        let features = table.features().len();
        self.dispatcher.replace_table(table);
        info!(address = %self.address, features, "Bindings rebuilt");
        Ok(())
    }

    /// Synchronous part of every teardown: cancel, clear, Disconnected.
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transition(ConnectionState::Disconnecting);
        self.stop_queue();
        self.dispatcher.clear();
        self.max_payload.store(protocol::DEFAULT_PAYLOAD_SIZE, Ordering::SeqCst);
        self.chunk_progress.send_replace(ChunkProgress::default());
        self.abort_tasks();
        self.transition(ConnectionState::Disconnected);
    }

    /// Teardown plus a background transport disconnect.
    fn shutdown(&self) {
        self.teardown();
        self.disconnect_transport();
    }

    fn disconnect_transport(&self) {
        let transport = self.transport.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect().await {
                warn!(%address, error = %e, "Transport disconnect failed");
            }
        });
    }

    /// Turns notifications on for `binding` if they are off.
    ///
    /// `Ok(false)` when the characteristic cannot notify or the board refused.
    async fn enable(&self, queue: &OperationQueue, binding: &CharacteristicBinding) -> Result<bool, SessionError> {
        if !binding.characteristic.properties.can_notify() {
            warn!(address = %self.address, characteristic = %binding.uuid(), "Characteristic cannot notify");
            return Ok(false);
        }
        if binding.subscription().enabled {
            return Ok(true);
        }
        match queue
            .set_notification(binding.uuid(), true, self.context.config.notification_timeout)
            .await
        {
            Ok(()) => {
                binding.update_subscription(|state| state.enabled = true);
                debug!(address = %self.address, characteristic = %binding.uuid(), "Notifications enabled");
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                warn!(address = %self.address, characteristic = %binding.uuid(), error = %e, "Enabling notifications failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Turns notifications off once `binding` has no subscriber left,
    /// unless the release policy keeps them on.
    async fn release(&self, queue: &OperationQueue, binding: &CharacteristicBinding) -> Result<bool, SessionError> {
        let state = binding.subscription();
        if state.subscribers() > 0
            || !state.enabled
            || self.context.config.notification_release == NotificationRelease::KeepEnabled
        {
            return Ok(true);
        }
        match queue
            .set_notification(binding.uuid(), false, self.context.config.notification_timeout)
            .await
        {
            Ok(()) => {
                binding.update_subscription(|state| state.enabled = false);
                debug!(address = %self.address, characteristic = %binding.uuid(), "Notifications disabled");
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                warn!(address = %self.address, characteristic = %binding.uuid(), error = %e, "Disabling notifications failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_chunked(&self, uuid: Uuid, value: &[u8], chunk: usize) -> Result<(), SessionError> {
        let queue = self.queue_for("write")?;
        let chunk = chunk.max(1);
        if value.len() <= chunk {
            return queue.write(uuid, value.to_vec(), self.context.config.write_timeout).await;
        }

        let total = value.len().div_ceil(chunk);
        self.chunk_progress.send_replace(ChunkProgress { total, current: 0 });
        for (index, part) in value.chunks(chunk).enumerate() {
            queue
                .write(uuid, part.to_vec(), self.context.config.write_timeout)
                .await?;
            self.chunk_progress.send_replace(ChunkProgress {
                total,
                current: index + 1,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CommandLink for SessionInner {
    fn command_target(&self, feature: &Feature) -> Option<CommandTarget> {
        let table = self.dispatcher.table();
        if feature.class() == FeatureClass::Standard {
            if let Some(config) = table
                .get(CONFIG_CONTROL_UUID)
                .filter(|binding| binding.characteristic.properties.can_write())
            {
                return Some(CommandTarget {
                    uuid: config.uuid(),
                    via_config: true,
                    writable: true,
                });
            }
        }
        table
            .bindings_for(feature.id())
            .max_by_key(|binding| binding.features.len())
            .map(|binding| CommandTarget {
                uuid: binding.uuid(),
                via_config: false,
                writable: binding.characteristic.properties.can_write(),
            })
    }

    fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::SeqCst)
    }

    fn notifications(&self) -> broadcast::Receiver<RawNotification> {
        self.raw.subscribe()
    }

    fn states(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn acquire_notification(&self, uuid: Uuid) -> Result<bool, SessionError> {
        let _gate = self.subscription_gate.lock().await;
        let queue = self.queue_for("enable notifications")?;
        let Some(binding) = self.dispatcher.table().get(uuid).cloned() else {
            return Ok(false);
        };
        let enabled = self.enable(&queue, &binding).await?;
        if enabled {
            binding.update_subscription(|state| state.add_internal());
        }
        Ok(enabled)
    }

    async fn release_notification(&self, uuid: Uuid) {
        let _gate = self.subscription_gate.lock().await;
        let Ok(queue) = self.queue_for("disable notifications") else {
            return;
        };
        let Some(binding) = self.dispatcher.table().get(uuid).cloned() else {
            return;
        };
        binding.update_subscription(|state| state.remove_internal());
        if let Err(e) = self.release(&queue, &binding).await {
            debug!(address = %self.address, error = %e, "Releasing response notifications failed");
        }
    }

    async fn write(&self, uuid: Uuid, value: &[u8], chunk: usize) -> Result<(), SessionError> {
        self.write_chunked(uuid, value, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::features::registry::characteristic_uuid;
    use crate::domain::features::CommandRequest;
    use crate::infrastructure::bluetooth::advertise::AdvertisementDecoder;
    use crate::infrastructure::bluetooth::simulated::{
        SimulatedBoard, SimulatedOperation, ENVIRONMENT_MASK, SWITCH_MASK,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn session(board: &Arc<SimulatedBoard>) -> ConnectionSession {
        let identity = AdvertisementDecoder::default()
            .decode(&board.advertisement())
            .unwrap();
        ConnectionSession::new(board.clone(), identity, SessionContext::with_defaults())
    }

    async fn ready(board: &Arc<SimulatedBoard>) -> ConnectionSession {
        let session = session(board);
        session.connect().await.unwrap();
        session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_binds_and_negotiates() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        board.set_mtu_limit(100);
        let session = ready(&board).await;

        assert_eq!(session.max_payload(), 97);
        assert!(session.feature("Temperature").is_some());
        assert!(session.feature("HeartRate").is_some());
        assert!(session.binding_errors().is_empty());

        let ops: Vec<_> = board.operation_log().into_iter().map(|(op, _)| op).collect();
        assert_eq!(
            ops,
            vec![
                SimulatedOperation::Connect,
                SimulatedOperation::DiscoverServices,
                SimulatedOperation::RequestMtu,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_reentrant() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let states = session.connect().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Ready);
        let connects = board
            .operation_log()
            .iter()
            .filter(|(op, _)| *op == SimulatedOperation::Connect)
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_failure_is_fatal() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        board.fail_next(SimulatedOperation::RequestMtu, 1);
        let session = session(&board);
        let mut transitions = session.transitions();
        session.connect().await.unwrap();

        let result = session.wait_for(ConnectionState::Ready, WAIT).await;
        assert!(matches!(result, Err(SessionError::Cancelled(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.features().is_empty());

        let mut seen = Vec::new();
        while let Ok(transition) = transitions.try_recv() {
            seen.push(transition.current);
        }
        assert!(seen.contains(&ConnectionState::ServicesDiscovered));
        assert!(!seen.contains(&ConnectionState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_disconnects() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        board.stall(SimulatedOperation::DiscoverServices);
        let session = session(&board);
        session.connect().await.unwrap();

        session
            .wait_for(ConnectionState::Disconnected, Duration::from_secs(60))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!board.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_connection() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = session(&board);
        let feature = SessionContext::with_defaults()
            .registry
            .standard_feature(session.identity().board_model, 0x0004_0000)
            .unwrap();

        assert!(matches!(
            session.subscribe(&[feature.clone()]).await,
            Err(SessionError::Precondition(_))
        ));
        assert!(matches!(
            session.read_feature(&feature, WAIT).await,
            Err(SessionError::Precondition(_))
        ));
        let command = FeatureCommand::new(feature, CommandRequest::Raw { command_id: 1, params: vec![] });
        assert!(matches!(
            session.write_command(&command, WAIT, 0, Duration::ZERO).await,
            Err(SessionError::Precondition(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_gate_keeps_counts() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        board.set_latency(Duration::from_millis(5));
        let session = Arc::new(ready(&board).await);
        let temperature = session.feature("Temperature").unwrap();
        let humidity = session.feature("Humidity").unwrap();
        let env = characteristic_uuid(FeatureClass::Standard, ENVIRONMENT_MASK);

        let temperature = [temperature];
        let humidity = [humidity];
        let (a, b) = tokio::join!(session.subscribe(&temperature), session.subscribe(&humidity));
        assert!(a.unwrap() && b.unwrap());
        // one descriptor write for the shared characteristic
        let enables = board
            .operation_log()
            .iter()
            .filter(|(op, uuid)| *op == SimulatedOperation::SetNotification && *uuid == Some(env))
            .count();
        assert_eq!(enables, 1);

        let (a, b) = tokio::join!(session.unsubscribe(&temperature), session.unsubscribe(&humidity));
        assert!(a.unwrap() && b.unwrap());
        assert!(!board.is_notifying(env));
        assert!(!session.is_notifying(env));
        assert_eq!(board.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_enabled_policy() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let identity = AdvertisementDecoder::default()
            .decode(&board.advertisement())
            .unwrap();
        let mut context = SessionContext::with_defaults();
        context.config.notification_release = NotificationRelease::KeepEnabled;
        let session = ConnectionSession::new(board.clone(), identity, context);
        session.connect().await.unwrap();
        session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();

        let temperature = session.feature("Temperature").unwrap();
        let env = characteristic_uuid(FeatureClass::Standard, ENVIRONMENT_MASK);
        assert!(session.subscribe(&[temperature.clone()]).await.unwrap());
        assert!(session.unsubscribe(&[temperature.clone()]).await.unwrap());
        assert_eq!(session.subscriber_count(&temperature), 0);
        assert!(board.is_notifying(env));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_reports_refused_characteristic() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        board.fail_next(SimulatedOperation::SetNotification, 1);
        let temperature = session.feature("Temperature").unwrap();
        assert!(!session.subscribe(&[temperature.clone()]).await.unwrap());
        assert_eq!(session.subscriber_count(&temperature), 0);
        assert!(session.subscribe(&[temperature.clone()]).await.unwrap());
        assert_eq!(session.subscriber_count(&temperature), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_feature_filters_updates() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let humidity = session.feature("Humidity").unwrap();

        let updates = session.read_feature(&humidity, WAIT).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "Humidity");

        let acceleration = session.feature("Acceleration").unwrap();
        assert!(session.read_feature(&acceleration, WAIT).await.unwrap().is_empty());

        let updates = session.read(&humidity).await.unwrap();
        assert_eq!(updates[0].name, "Humidity");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_uses_configured_timeout() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let humidity = session.feature("Humidity").unwrap();
        board.stall(SimulatedOperation::Read);

        let started = time::Instant::now();
        let result = session.read(&humidity).await;
        assert!(matches!(result, Err(SessionError::TransportTimeout { .. })));
        let read_timeout = SessionConfig::default().read_timeout;
        assert!(started.elapsed() >= read_timeout);
        assert!(started.elapsed() < read_timeout + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_only_feature_is_not_subscribed() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let config = session.feature("ExtConfiguration").unwrap();
        let temperature = session.feature("Temperature").unwrap();

        assert!(!session
            .subscribe(&[config.clone(), temperature.clone()])
            .await
            .unwrap());
        assert_eq!(session.subscriber_count(&config), 0);
        assert_eq!(session.subscriber_count(&temperature), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_write_progress() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let switch = characteristic_uuid(FeatureClass::Standard, SWITCH_MASK);
        let progress = session.chunk_progress();

        session.inner.write_chunked(switch, &[7u8; 45], 20).await.unwrap();
        assert_eq!(*progress.borrow(), ChunkProgress { total: 3, current: 3 });
        let writes = board.writes_to(switch);
        assert_eq!(writes.iter().map(Vec::len).collect::<Vec<_>>(), vec![20, 20, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_write_fails_fast() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        let switch = characteristic_uuid(FeatureClass::Standard, SWITCH_MASK);
        board.fail_next(SimulatedOperation::Write, 1);

        let result = session.inner.write_chunked(switch, &[7u8; 45], 20).await;
        assert!(matches!(result, Err(SessionError::TransportFailure { .. })));
        // the failed first chunk is recorded by the board only when it succeeds
        assert!(board.writes_to(switch).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_tears_down() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        board.drop_link();
        session
            .wait_for(ConnectionState::Disconnected, WAIT)
            .await
            .unwrap();
        assert!(session.features().is_empty());
        assert_eq!(session.max_payload(), protocol::DEFAULT_PAYLOAD_SIZE);

        // and a fresh connection comes back up
        session.connect().await.unwrap();
        session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_cancels_connect() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        board.set_latency(Duration::from_millis(100));
        let session = Arc::new(session(&board));
        let connecting = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await.map(|_| ()) }
        });

        time::sleep(Duration::from_millis(10)).await;
        session.disconnect();
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled(_))));
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!board.is_connected());

        // no leftover pump tears the next link down
        session.connect().await.unwrap();
        session.wait_for(ConnectionState::Ready, WAIT).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let board = Arc::new(SimulatedBoard::sensor_node("AA"));
        let session = ready(&board).await;
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.disconnect();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!board.is_connected());
    }
}
