//! Session and feature-protocol engine for BLE sensor boards.
//!
//! The [`domain`] layer holds the protocol data (board models, device
//! identities, feature decoders and the registry that binds them to
//! characteristics). The [`infrastructure`] layer drives the link: the
//! operation queue, notification dispatch, command correlation and the
//! per-device connection session.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::features::{
    CommandRequest, Feature, FeatureCommand, FeatureId, FeatureResponse, FeatureSample,
    FeatureUpdate,
};
pub use domain::features::registry::FeatureRegistry;
pub use domain::models::{ConnectionState, DeviceIdentity};
pub use error::SessionError;
pub use infrastructure::bluetooth::{ConnectionSession, NodeService};
