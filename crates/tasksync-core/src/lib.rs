//! TaskSync Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Operation`, `EntitySnapshot`, `ConflictRecord`, `SyncSession`
//! - **Hybrid clock** - the single authority for server-side ordering
//! - **Port definitions** - Traits for adapters: `IEntityStore`, `IOperationStore`, `IChangeNotifier`
//! - **Configuration** - YAML-backed settings for sync, batch transfer and logging
//!
//! # Architecture
//!
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.
//! The sync and conflict crates orchestrate domain entities through port interfaces.

pub mod clock;
pub mod config;
pub mod domain;
pub mod ports;
