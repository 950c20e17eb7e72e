//! Notification dispatch
//!
//! Each notification is decoded once, against the features bound to its
//! characteristic, and the resulting updates are fanned out to the logging
//! sink and to every caller whose requested feature set contains them.
//!
//! ```text
//! [u16 timestamp][feature A][feature B]...   standard characteristic
//! [feature]                                  timestamp-less characteristic
//! ```

use crate::domain::boards::BoardModel;
use crate::domain::features::registry::FeatureRegistry;
use crate::domain::features::{Feature, FeatureClass, FeatureId, FeatureUpdate};
use crate::domain::timestamp::TimestampUnwrapper;
use crate::error::RegistryError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{GattCharacteristic, GattService};
use crate::infrastructure::bluetooth::update_log::LoggerSink;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Raw notification as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Who asked for notifications on a characteristic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Per-feature subscriber counts
    features: HashMap<FeatureId, usize>,
    /// Holders that are not feature subscribers (command correlation)
    internal: usize,
    pub enabled: bool,
}

impl SubscriptionState {
    pub fn subscribers(&self) -> usize {
        self.features.values().sum::<usize>() + self.internal
    }

    pub fn feature_subscribers(&self, id: FeatureId) -> usize {
        self.features.get(&id).copied().unwrap_or(0)
    }

    pub(crate) fn add_feature(&mut self, id: FeatureId) {
        *self.features.entry(id).or_default() += 1;
    }

    /// Returns false when `id` had no subscriber.
    pub(crate) fn remove_feature(&mut self, id: FeatureId) -> bool {
        match self.features.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.features.remove(&id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn add_internal(&mut self) {
        self.internal += 1;
    }

    pub(crate) fn remove_internal(&mut self) {
        self.internal = self.internal.saturating_sub(1);
    }
}

/// A discovered characteristic and the features decoded from it.
#[derive(Debug)]
pub struct CharacteristicBinding {
    pub characteristic: GattCharacteristic,
    pub features: Vec<Arc<Feature>>,
    unwrapper: Mutex<TimestampUnwrapper>,
    subscription: Mutex<SubscriptionState>,
}

impl CharacteristicBinding {
    pub fn new(characteristic: GattCharacteristic, features: Vec<Arc<Feature>>) -> Self {
        Self {
            characteristic,
            features,
            unwrapper: Mutex::new(TimestampUnwrapper::new()),
            subscription: Mutex::new(SubscriptionState::default()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    pub fn contains(&self, id: FeatureId) -> bool {
        self.features.iter().any(|feature| feature.id() == id)
    }

    /// False only when every bound feature declares it has no timestamp.
    pub fn carries_timestamp(&self) -> bool {
        self.features.iter().any(|feature| feature.has_timestamp())
    }

    pub fn subscription(&self) -> SubscriptionState {
        self.subscription
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Mutates the subscription state. Callers hold the session subscription gate.
    pub(crate) fn update_subscription<R>(&self, update: impl FnOnce(&mut SubscriptionState) -> R) -> R {
        let mut state = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut state)
    }

    /// Decodes every bound feature from one notification or read.
    ///
    /// A feature that fails to decode is logged and skipped; the others are
    /// still decoded. Only standard features advance the cursor.
    pub fn decode(&self, data: &[u8]) -> Vec<FeatureUpdate> {
        let (timestamp, mut offset) = if self.carries_timestamp() {
            let raw = protocol::device_timestamp(data);
            let Ok(mut unwrapper) = self.unwrapper.lock() else {
                return Vec::new();
            };
            match raw {
                Some(raw) => (unwrapper.unwrap(raw), protocol::TIMESTAMP_SIZE),
                None => {
                    debug!(characteristic = %self.uuid(), len = data.len(), "No timestamp in notification");
                    (unwrapper.next(), 0)
                }
            }
        } else {
            (protocol::wall_clock_timestamp(), 0)
        };

        let mut updates = Vec::with_capacity(self.features.len());
        for feature in &self.features {
            match feature.decode(timestamp, data, offset) {
                Ok(update) => {
                    if feature.class() == FeatureClass::Standard {
                        offset += update.bytes_consumed;
                    }
                    updates.push(update);
                }
                Err(e) => {
                    warn!(feature = %feature, error = %e, "Failed to decode feature");
                }
            }
        }
        updates
    }
}

/// Characteristic bindings for one discovery pass. Immutable once built;
/// rediscovery builds a new table and swaps it in.
#[derive(Debug, Default)]
pub struct BindingTable {
    bindings: Vec<Arc<CharacteristicBinding>>,
    by_uuid: HashMap<Uuid, usize>,
    errors: Vec<RegistryError>,
    /// Standard features missing from the advertised v1 mask
    disabled: HashSet<FeatureId>,
}

impl BindingTable {
    /// Binds every discovered characteristic. With an `advertised` mask,
    /// standard features whose bit is not in it are bound but disabled.
    pub fn build(
        services: &[GattService],
        registry: &FeatureRegistry,
        board: BoardModel,
        advertised: Option<u32>,
    ) -> Self {
        let mut table = BindingTable::default();

        for characteristic in services.iter().flat_map(|service| &service.characteristics) {
            let features = match registry.resolve(&characteristic.uuid, board) {
                Ok(resolved) => {
                    for error in &resolved.errors {
                        warn!(characteristic = %characteristic.uuid, error = %error, "Unknown feature bit");
                    }
                    table.errors.extend(resolved.errors);
                    resolved.features
                }
                Err(RegistryError::UnknownFamily(uuid)) => {
                    trace!(characteristic = %uuid, "Characteristic carries no feature");
                    Vec::new()
                }
                Err(error) => {
                    warn!(characteristic = %characteristic.uuid, error = %error, "Cannot bind characteristic");
                    table.errors.push(error);
                    Vec::new()
                }
            };

            if let Some(mask) = advertised {
                for feature in features
                    .iter()
                    .filter(|feature| feature.mask().is_some_and(|bit| bit & mask == 0))
                {
                    debug!(feature = %feature, "Feature not advertised, disabled");
                    table.disabled.insert(feature.id());
                }
            }

            if !features.is_empty() {
                debug!(
                    characteristic = %characteristic.uuid,
                    features = ?features.iter().map(|f| f.name()).collect::<Vec<_>>(),
                    "Bound characteristic"
                );
            }
            table.insert(CharacteristicBinding::new(characteristic.clone(), features));
        }

        table
    }

    fn insert(&mut self, binding: CharacteristicBinding) {
        match self.by_uuid.get(&binding.uuid()) {
            Some(&index) => self.bindings[index] = Arc::new(binding),
            None => {
                self.by_uuid.insert(binding.uuid(), self.bindings.len());
                self.bindings.push(Arc::new(binding));
            }
        }
    }

    /// Copies subscription state from `previous` for characteristics present in both.
    pub fn carry_over(&self, previous: &BindingTable) {
        for binding in &self.bindings {
            if let Some(old) = previous.get(binding.uuid()) {
                let state = old.subscription();
                binding.update_subscription(|current| *current = state);
            }
        }
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Arc<CharacteristicBinding>> {
        self.by_uuid.get(&uuid).map(|&index| &self.bindings[index])
    }

    pub fn bindings(&self) -> &[Arc<CharacteristicBinding>] {
        &self.bindings
    }

    pub fn bindings_for(&self, id: FeatureId) -> impl Iterator<Item = &Arc<CharacteristicBinding>> {
        self.bindings.iter().filter(move |binding| binding.contains(id))
    }

    /// Distinct bound features in discovery order.
    pub fn features(&self) -> Vec<Arc<Feature>> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .flat_map(|binding| binding.features.iter())
            .filter(|feature| seen.insert(feature.id()))
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> &[RegistryError] {
        &self.errors
    }

    pub fn is_enabled(&self, id: FeatureId) -> bool {
        !self.disabled.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Stream of updates for the features a caller asked for.
pub struct UpdateReceiver {
    receiver: mpsc::Receiver<FeatureUpdate>,
}

impl UpdateReceiver {
    pub async fn recv(&mut self) -> Option<FeatureUpdate> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeatureUpdate> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for UpdateReceiver {
    type Item = FeatureUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

struct UpdateSubscriber {
    features: HashSet<FeatureId>,
    sender: mpsc::Sender<FeatureUpdate>,
}

pub struct NotificationDispatcher {
    address: Arc<str>,
    table: RwLock<Arc<BindingTable>>,
    subscribers: Mutex<Vec<UpdateSubscriber>>,
    sink: LoggerSink,
    buffer: usize,
}

impl NotificationDispatcher {
    pub fn new(address: &str, sink: LoggerSink, buffer: usize) -> Self {
        Self {
            address: Arc::from(address),
            table: RwLock::new(Arc::new(BindingTable::default())),
            subscribers: Mutex::new(Vec::new()),
            sink,
            buffer: buffer.max(1),
        }
    }

    /// Snapshot of the current bindings.
    pub fn table(&self) -> Arc<BindingTable> {
        self.table
            .read()
            .map(|table| table.clone())
            .unwrap_or_default()
    }

    /// Installs a new table; decoders holding the old snapshot finish on it.
    pub fn replace_table(&self, table: BindingTable) -> Arc<BindingTable> {
        let table = Arc::new(table);
        match self.table.write() {
            Ok(mut current) => std::mem::replace(&mut *current, table),
            Err(_) => table,
        }
    }

    pub fn clear(&self) {
        self.replace_table(BindingTable::default());
    }

    /// Channel receiving updates of `features` only.
    pub fn updates(&self, features: &[Arc<Feature>]) -> UpdateReceiver {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let subscriber = UpdateSubscriber {
            features: features.iter().map(|feature| feature.id()).collect(),
            sender,
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(subscriber);
        }
        UpdateReceiver { receiver }
    }

    /// Decodes with the binding and logs every update, without fan-out.
    pub fn decode(&self, binding: &CharacteristicBinding, value: &[u8]) -> Vec<FeatureUpdate> {
        let updates = binding.decode(value);
        for update in &updates {
            self.sink.log(&self.address, update);
        }
        updates
    }

    /// Handles one notification; returns how many updates it produced.
    pub fn dispatch(&self, uuid: Uuid, value: &[u8]) -> usize {
        let table = self.table();
        let Some(binding) = table.get(uuid).filter(|binding| !binding.features.is_empty()) else {
            trace!(characteristic = %uuid, "Notification on unbound characteristic");
            return 0;
        };

        let updates = self.decode(binding, value);
        if updates.is_empty() {
            return 0;
        }

        let Ok(mut subscribers) = self.subscribers.lock() else {
            return updates.len();
        };
        subscribers.retain(|subscriber| {
            for update in updates.iter().filter(|u| subscriber.features.contains(&u.feature)) {
                match subscriber.sender.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(device = %self.address, feature = update.name, "Subscriber lagging, dropping update");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
        updates.len()
    }
}
