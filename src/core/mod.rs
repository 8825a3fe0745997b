//! Core module - Node controller, stone records, supervision and accounting

mod cleanup;
mod error;
mod files;
mod instance;
mod node;
mod process;
pub mod resource;
pub mod settings;

pub use error::{NodeError, NodeResult};
pub use files::StoneFiles;
pub use instance::{generate_name, is_generated_name, Plan, ProvisionedService};
pub use node::{Announcement, BindResponse, Node, ProvisionResponse};
pub use process::StoneSupervisor;
pub use resource::MemoryLedger;
pub use settings::{NodeConfig, ToolConfig};
