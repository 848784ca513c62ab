//! # helmbuild library
//!
//! Offline builder for Flux-style HelmRelease declarations: ingests a tree of
//! YAML documents, resolves and fetches the referenced charts, renders each
//! release through a dry-run install and emits one YAML stream, without ever
//! contacting a Kubernetes API server.

pub mod build;
pub mod cache;
pub mod chart;
pub mod cli;
pub mod error;
pub mod event;
pub mod ingest;
pub mod logging;
pub mod registry;
pub mod release;
pub mod render;
pub mod resource;
pub mod utils;
