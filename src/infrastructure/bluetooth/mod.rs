//! Bluetooth Module
//!
//! Session and feature-protocol engine for ST sensor boards over BLE GATT.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       NodeService                         │
//! │   (scanner, shared registry, one session per address)     │
//! └──────────────┬──────────────────────────┬────────────────┘
//!                │                          │
//!                ▼                          ▼
//! ┌──────────────────────┐     ┌─────────────────────────────┐
//! │    DeviceScanner     │     │      ConnectionSession      │
//! │ - advertisement      │     │ - state machine             │
//! │   dialect filters    │     │ - bring-up / teardown       │
//! └──────────────────────┘     │ - subscription counts       │
//!                              └──────┬───────────┬──────────┘
//!                                     │           │
//!                     ┌───────────────┘           └───────────────┐
//!                     ▼                                           ▼
//!          ┌─────────────────────┐                   ┌─────────────────────────┐
//!          │   OperationQueue    │                   │ NotificationDispatcher  │
//!          │ one GATT op at once │                   │ decode once, fan out    │
//!          └─────────┬───────────┘                   │ commands: correlation   │
//!                    ▼                               └─────────────────────────┘
//!          ┌─────────────────────┐
//!          │    BleTransport     │  (platform primitive or SimulatedBoard)
//!          └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`advertise`] - Advertisement TLV parsing and dialect filters
//! - [`commands`] - Command write, retry and response correlation
//! - [`connection`] - Per-device session
//! - [`dispatcher`] - Characteristic bindings and notification fan-out
//! - [`protocol`] - Wire constants and helpers
//! - [`queue`] - Single-in-flight operation queue
//! - [`scanner`] - Device discovery
//! - [`service`] - Multi-device coordinator and board catalog hook
//! - [`simulated`] - In-memory board for tests and the demo
//! - [`transport`] - Platform BLE abstraction
//! - [`update_log`] - Process-wide feature update loggers

pub mod advertise;
pub mod commands;
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;
pub mod update_log;

pub use connection::{ConnectionSession, SessionContext};
pub use service::NodeService;
