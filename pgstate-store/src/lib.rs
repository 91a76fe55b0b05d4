//! Core engine of the pgstate pluggable state store: tenant-aware routing,
//! lazy provisioning of per-tenant schemas/tables, optimistic-concurrency
//! CRUD with transactional batching, and background TTL expiration, all on
//! top of a shared PostgreSQL database.
//!
//! The wire surface lives in `pgstate-proto`; process wiring lives in the
//! `pgstate` binary crate. Nothing in here knows about gRPC.

pub mod config;
pub mod engine;
pub mod error;
pub mod janitor;
pub mod pg;
pub mod provision;
pub mod registry;
pub mod routing;

pub use config::{StoreConfig, TenantMode};
pub use engine::{
    BulkGetEntry, DeleteOperation, GetOperation, SetOperation, StateStore, TransactOperation,
    FEATURES,
};
pub use error::StoreError;
pub use provision::ResourceProvisioner;
pub use routing::StateTarget;
