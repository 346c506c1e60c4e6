//! Portalcrane: container-registry management appliance.
//!
//! This crate is the core mediating a local OCI Distribution registry: an
//! authenticating reverse proxy (C6), a staging ingestion pipeline with
//! vulnerability gating (C7), a catalog replication engine (C8), and a
//! registry lifecycle controller (C9). The HTTP router/web framework,
//! dashboard, Docker Hub search, and CRUD persistence for users/folders/
//! external registries/OIDC config are external collaborators this crate
//! consumes only through the interfaces it defines (stores, clients).

pub mod api;
pub mod audit;
pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod pathsafety;
pub mod proxy;
pub mod registry_client;
pub mod replication;
pub mod staging;
pub mod store;
pub mod supervisor;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
