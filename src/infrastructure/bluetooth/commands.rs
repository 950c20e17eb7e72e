//! Command / response correlation
//!
//! A command is written to its target characteristic (the configuration
//! control characteristic for standard features when the board has one) and
//! the next notification on that characteristic that parses as an answer to
//! the same command id is returned. Write failures are retried and then reported as a
//! [`FeatureResponse::WriteError`] value; a missing answer is `None`.

use crate::domain::features::stl2::Stl2Reassembler;
use crate::domain::features::{
    Feature, FeatureClass, FeatureCommand, FeatureResponse, COMMAND_RESPONSE_MIN_LEN,
};
use crate::domain::models::ConnectionState;
use crate::error::SessionError;
use crate::infrastructure::bluetooth::dispatcher::RawNotification;
use crate::infrastructure::bluetooth::protocol;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// How a failed command write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub retries: usize,
    pub delay: Duration,
    /// No new attempt starts once this much time has passed since the first
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            budget: Duration::ZERO,
        }
    }
}

/// Where a command for a given feature goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTarget {
    pub uuid: Uuid,
    /// Written to the configuration control characteristic, mask prefixed
    pub via_config: bool,
    pub writable: bool,
}

/// What the correlator needs from a connected session.
#[async_trait]
pub trait CommandLink: Send + Sync {
    /// `None` when the feature is not bound on this connection.
    fn command_target(&self, feature: &Feature) -> Option<CommandTarget>;

    /// Negotiated payload per write.
    fn max_payload(&self) -> usize;

    fn notifications(&self) -> broadcast::Receiver<RawNotification>;

    fn states(&self) -> watch::Receiver<ConnectionState>;

    /// Holds notifications on `uuid` enabled for the correlator. `Ok(false)`
    /// when the board refused to enable them.
    async fn acquire_notification(&self, uuid: Uuid) -> Result<bool, SessionError>;

    async fn release_notification(&self, uuid: Uuid);

    /// Writes `value` in `chunk`-sized pieces through the operation queue.
    async fn write(&self, uuid: Uuid, value: &[u8], chunk: usize) -> Result<(), SessionError>;
}

/// Sends `command` and waits up to `response_timeout` for its answer.
///
/// - `Ok(Some(Empty))`: written, no answer expected or wanted
/// - `Ok(Some(WriteError))`: every write attempt failed
/// - `Ok(None)`: written, nothing answered in time
/// - `Err(_)`: not connected, unsupported, or cancelled by a disconnect
pub async fn send_command(
    link: &dyn CommandLink,
    command: &FeatureCommand,
    response_timeout: Duration,
    retry: RetryPolicy,
) -> Result<Option<FeatureResponse>, SessionError> {
    let feature = &command.feature;
    let command_id = command.command_id();

    if feature.class() == FeatureClass::GeneralPurpose {
        return Err(SessionError::Unsupported(format!(
            "general purpose feature {feature} does not accept commands"
        )));
    }
    let payload = feature.encode_command(&command.request).ok_or_else(|| {
        SessionError::Unsupported(format!("{feature} cannot encode {:?}", command.request))
    })?;
    let target = link
        .command_target(feature)
        .ok_or_else(|| SessionError::not_connected("write command"))?;

    let write_error = FeatureResponse::WriteError {
        feature: feature.id(),
        command_id,
    };
    if !target.writable {
        warn!(feature = %feature, characteristic = %target.uuid, "Command target is not writable");
        return Ok(Some(write_error));
    }

    let wants_response = command.has_response && feature.expects_response(&command.request);
    // notifications on the configuration characteristic stay on for the session
    let release_after = wants_response && !target.via_config;
    let mut notifications = None;
    let mut states = link.states();
    if wants_response {
        if !link.acquire_notification(target.uuid).await? {
            warn!(characteristic = %target.uuid, "Could not enable response notifications");
        }
        // before the write, so an immediate answer is not missed
        notifications = Some(link.notifications());
    }

    let chunk = protocol::chunk_size(feature.max_write_payload(), link.max_payload());
    let written = write_with_retry(link, target.uuid, &payload, chunk, retry).await;

    let outcome = match written {
        Ok(()) => match notifications {
            None => Ok(Some(FeatureResponse::Empty {
                feature: feature.id(),
                command_id,
            })),
            Some(notifications) if !response_timeout.is_zero() => {
                await_response(feature, command_id, target, notifications, &mut states, response_timeout)
                    .await
            }
            Some(_) => Ok(None),
        },
        Err(e) if e.is_retryable() => {
            warn!(feature = %feature, command_id, error = %e, "Command write failed");
            Ok(Some(write_error))
        }
        Err(e) => Err(e),
    };

    if release_after {
        link.release_notification(target.uuid).await;
    }
    outcome
}

async fn write_with_retry(
    link: &dyn CommandLink,
    uuid: Uuid,
    payload: &[u8],
    chunk: usize,
    retry: RetryPolicy,
) -> Result<(), SessionError> {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match link.write(uuid, payload, chunk).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < retry.retries => {
                if started.elapsed() >= retry.budget {
                    warn!(characteristic = %uuid, attempt, budget = ?retry.budget, "Retry budget exhausted");
                    return Err(e);
                }
                attempt += 1;
                debug!(characteristic = %uuid, attempt, error = %e, "Retrying command write");
                time::sleep(retry.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn await_response(
    feature: &Feature,
    command_id: u8,
    target: CommandTarget,
    mut notifications: broadcast::Receiver<RawNotification>,
    states: &mut watch::Receiver<ConnectionState>,
    response_timeout: Duration,
) -> Result<Option<FeatureResponse>, SessionError> {
    let deadline = time::sleep(response_timeout);
    tokio::pin!(deadline);
    let mut reassembler = feature.kind().is_stl2_framed().then(Stl2Reassembler::new);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!(feature = %feature, ?response_timeout, "No response before timeout");
                return Ok(None);
            }
            changed = states.changed() => {
                let connected = changed.is_ok() && states.borrow_and_update().is_connected();
                if !connected {
                    return Err(SessionError::Cancelled(format!("response from {feature}")));
                }
            }
            received = notifications.recv() => {
                let notification = match received {
                    Ok(notification) => notification,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(feature = %feature, skipped, "Response listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SessionError::Cancelled(format!("response from {feature}")));
                    }
                };
                if notification.uuid != target.uuid {
                    continue;
                }
                if target.via_config && notification.value.len() <= COMMAND_RESPONSE_MIN_LEN {
                    trace!(len = notification.value.len(), "Ignoring short configuration notification");
                    continue;
                }

                let value = match reassembler.as_mut() {
                    Some(reassembler) => match reassembler.push(&notification.value) {
                        Some(message) => message,
                        None => continue,
                    },
                    None => notification.value,
                };
                let Some(response) = feature.parse_response(&value) else {
                    continue;
                };
                // ExtConfig answers carry no command id
                if response.command_id().is_some_and(|id| id != command_id) {
                    trace!(feature = %feature, expected = command_id, got = ?response.command_id(), "Answer to another command");
                    continue;
                }
                debug!(feature = %feature, command_id, "Command answered");
                return Ok(Some(response));
            }
        }
    }
}
