//! Prefbox: a durable, typed key-value settings store.
//!
//! Settings live in one SQLite table shared by every process that opens the
//! same database. Each process reads through a local cache that mirrors the
//! table and sees its own writes before they are committed.
//!
//! # Architecture
//!
//! - **Transactional**: writes run in `BEGIN IMMEDIATE` transactions; batches
//!   coalesce into one transaction and yield the lock at declared points
//! - **Notified**: changed resources are published once per commit
//! - **Cached**: a local mirror with a pending-write overlay answers reads
//! - **Serial writes**: background commits apply in submission order
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`contract`]: Table layout and resource identifiers
//! - [`setting`]: The setting record and its value codec
//! - [`storage`]: SQLite persistence and transactions
//! - [`flow`]: Change notification bus
//! - [`service`]: The settings service and batches
//! - [`cache`]: Local cache of the settings collection
//! - [`task`]: Serial write queue
//! - [`settings`]: Typed facade, editors and change listeners
//! - [`observability`]: Metrics and tracing setup

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // settings::SettingsCache is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // id/ids/row_id are fine
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod cache;
pub mod config;
pub mod contract;
pub mod error;
pub mod flow;
pub mod observability;
pub mod service;
pub mod setting;
pub mod settings;
pub mod storage;
pub mod task;

pub use cache::{CacheListener, SettingsCache};
pub use config::Config;
pub use contract::{Contract, ResourceId};
pub use error::{Error, Result};
pub use flow::notify::{ChangeEvent, ChangeObserver, NotificationBus, ObserverId};
pub use service::{Operation, OperationKind, OperationResult, Resolver, SettingsService};
pub use setting::{Setting, SettingValue, ValueType};
pub use settings::{Editor, ListenerId, Settings};
pub use storage::store::{Filter, Query, SortOrder};
