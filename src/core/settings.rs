//! Node configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::error::{NodeError, NodeResult};
use super::instance::Plan;

/// Locations of the external GemStone/MagLev tools.
///
/// Relative paths are resolved against `maglev_home`. A bare program name
/// (no directory component) is looked up on `PATH` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Starts a stone; daemonizes and returns
    pub start_stone: PathBuf,
    /// Blocks until the named stone is ready
    pub wait_stone: PathBuf,
    /// Lists running stones; `-p <name>` prints the stone's pid
    pub list_stones: PathBuf,
    /// Build tool running the `stone:create` / `stone:destroy` tasks
    pub rake: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            start_stone: PathBuf::from("gemstone/bin/startstone"),
            wait_stone: PathBuf::from("gemstone/bin/waitstone"),
            list_stones: PathBuf::from("gemstone/bin/gslist"),
            rake: PathBuf::from("rake"),
        }
    }
}

impl ToolConfig {
    /// Resolve a tool path against the installation root
    pub fn resolve(&self, tool: &Path, maglev_home: &Path) -> PathBuf {
        if tool.is_absolute() || tool.components().count() == 1 {
            tool.to_path_buf()
        } else {
            maglev_home.join(tool)
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node, used in logs
    pub node_id: String,
    /// Address reported to clients as the stone's hostname
    pub local_ip: String,
    /// Total memory this node may hand out to stones
    pub available_memory: i64,
    /// Largest quota a single stone may receive
    pub max_memory: i64,
    /// Root of the node-local working trees (one directory per stone)
    pub base_dir: Option<PathBuf>,
    /// Record store connection string
    pub local_db: Option<String>,
    /// MagLev installation root
    pub maglev_home: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,
    /// External tool locations
    pub tools: ToolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "maglev_node_0".to_string(),
            local_ip: "127.0.0.1".to_string(),
            available_memory: 4096,
            max_memory: 256,
            base_dir: None,
            local_db: None,
            maglev_home: None,
            debug_logging: false,
            history_retention_days: 30,
            tools: ToolConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: NodeConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Get the data directory used for defaults
    pub fn get_data_directory() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("maglev-node")
    }

    /// Get the working tree root, using the default if not set
    pub fn get_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| Self::get_data_directory().join("instances"))
    }

    /// Get the record store connection string, using the default if not set
    pub fn get_local_db(&self) -> String {
        self.local_db.clone().unwrap_or_else(|| {
            format!(
                "sqlite:{}",
                Self::get_data_directory().join("maglev_node.db").display()
            )
        })
    }

    /// Get the MagLev installation root
    pub fn get_maglev_home(&self) -> NodeResult<&Path> {
        self.maglev_home
            .as_deref()
            .ok_or_else(|| NodeError::Config("Maglev home not set".to_string()))
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> NodeResult<()> {
        self.get_maglev_home()?;

        if self.available_memory <= 0 {
            return Err(NodeError::Config(format!(
                "available_memory must be positive, got {}",
                self.available_memory
            )));
        }

        if let Some(plan) = Plan::all().iter().find(|p| p.memory() > self.max_memory) {
            return Err(NodeError::Config(format!(
                "max_memory {} is smaller than the {} plan quota of {}",
                self.max_memory,
                plan,
                plan.memory()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NodeConfig {
        NodeConfig {
            maglev_home: Some(PathBuf::from("/opt/maglev")),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_home_is_set() {
        assert!(config().validate().is_ok());
        assert!(matches!(
            NodeConfig::default().validate(),
            Err(NodeError::Config(_))
        ));
    }

    #[test]
    fn max_memory_must_cover_every_plan() {
        let config = NodeConfig {
            max_memory: 128,
            ..config()
        };
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"maglev_home": "/opt/maglev", "available_memory": 300}"#)
                .unwrap();
        assert_eq!(config.available_memory, 300);
        assert_eq!(config.max_memory, 256);
        assert_eq!(config.local_ip, "127.0.0.1");
        assert_eq!(config.tools.rake, PathBuf::from("rake"));
    }

    #[test]
    fn tool_paths_resolve_against_home() {
        let tools = ToolConfig::default();
        let home = Path::new("/opt/maglev");
        assert_eq!(
            tools.resolve(&tools.start_stone, home),
            PathBuf::from("/opt/maglev/gemstone/bin/startstone")
        );
        assert_eq!(tools.resolve(&tools.rake, home), PathBuf::from("rake"));
        assert_eq!(
            tools.resolve(Path::new("/usr/bin/rake"), home),
            PathBuf::from("/usr/bin/rake")
        );
    }

    #[test]
    fn local_db_default_uses_sqlite_scheme() {
        assert!(config().get_local_db().starts_with("sqlite:"));
    }
}
