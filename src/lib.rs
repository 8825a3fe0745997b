//! maglev-node - Provision and supervise MagLev stones on a single host
//!
//! A broker drives the node through four operations (provision,
//! unprovision, bind, unbind) plus a capacity announcement. Each provisioned
//! stone is a long-running GemStone process with its own repository,
//! recorded in a local SQLite store so the node can bring it back after a
//! restart.

pub mod core;
pub mod persistence;
pub mod platform;
pub mod service;

pub use crate::core::{
    Announcement, BindResponse, Node, NodeConfig, NodeError, NodeResult, Plan,
    ProvisionResponse, ProvisionedService,
};

/// Application name constant
pub const APP_NAME: &str = "maglev-node";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
