//! Activator - a multi-tenant gateway that provisions services on demand
//!
//! This library provides an HTTP gateway that:
//! - Maps path-addressed tenant requests onto per-tenant frontend and backend services
//! - Checks whether the target service is alive before forwarding to it
//! - Asks an orchestration service to provision tenants and apps when they are missing
//! - Streams requests and responses through a pooled reverse proxy
//! - Exposes an internal admin API for health and registry introspection

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod routes;
