//! Provisioned stone instances - One entry per stone stored in the record store

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::NodeError;

/// Prefix of every generated stone name
pub const INSTANCE_NAME_PREFIX: &str = "maglev-";

/// Service tier of a provisioned stone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
}

impl Plan {
    /// Memory quota assigned to stones of this plan
    pub fn memory(&self) -> i64 {
        match self {
            Self::Free => 256,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Free => "free",
        }
    }

    pub fn all() -> &'static [Plan] {
        &[Plan::Free]
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Plan {
    type Err = NodeError;

    /// Accepts `free` as well as the symbol form `:free` used by the broker.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().trim_start_matches(':');
        Plan::all()
            .iter()
            .copied()
            .find(|plan| plan.label().eq_ignore_ascii_case(key))
            .ok_or_else(|| NodeError::InvalidPlan(s.to_string()))
    }
}

/// Generate a fresh, globally unique stone name
pub fn generate_name() -> String {
    format!("{}{}", INSTANCE_NAME_PREFIX, Uuid::new_v4())
}

/// Check whether `name` looks like a name produced by [`generate_name`]
pub fn is_generated_name(name: &str) -> bool {
    name.strip_prefix(INSTANCE_NAME_PREFIX)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}

/// A provisioned stone.
///
/// The name doubles as the stone name handed to the GemStone tools and as
/// the primary key in the record store. `memory`, `plan` and `maglev_home`
/// never change after creation; `pid` is whatever the process listing
/// reported the last time the stone was started and may be stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedService {
    pub name: String,
    pub memory: i64,
    pub plan: Plan,
    pub pid: Option<u32>,
    pub maglev_home: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ProvisionedService {
    /// Create an unsaved record for a new stone
    pub fn new(plan: Plan, maglev_home: impl Into<PathBuf>) -> Self {
        Self {
            name: generate_name(),
            memory: plan.memory(),
            plan,
            pid: None,
            maglev_home: maglev_home.into(),
            created_at: Utc::now(),
        }
    }

    /// `$MAGLEV_HOME/gemstone`
    pub fn gemstone_dir(&self) -> PathBuf {
        self.maglev_home.join("gemstone")
    }

    /// `$MAGLEV_HOME/etc/conf.d/<name>.conf`
    pub fn config_file(&self) -> PathBuf {
        self.maglev_home
            .join("etc")
            .join("conf.d")
            .join(format!("{}.conf", self.name))
    }

    /// `$MAGLEV_HOME/data/<name>`
    pub fn data_dir(&self) -> PathBuf {
        self.maglev_home.join("data").join(&self.name)
    }

    /// The primary extent; its presence means the repository exists
    pub fn extent_file(&self) -> PathBuf {
        self.data_dir().join("extent").join("extent0.ruby.dbf")
    }

    /// `$MAGLEV_HOME/log/<name>`
    pub fn log_dir(&self) -> PathBuf {
        self.maglev_home.join("log").join(&self.name)
    }

    /// Node-local working tree for this stone
    pub fn working_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.name)
    }

    /// Environment for the stone process itself
    pub fn stone_environment(&self) -> Vec<(String, PathBuf)> {
        let log_dir = self.log_dir();
        vec![
            ("MAGLEV_HOME".to_string(), self.maglev_home.clone()),
            ("GEMSTONE".to_string(), self.gemstone_dir()),
            ("GEMSTONE_GLOBAL_DIR".to_string(), self.maglev_home.clone()),
            (
                "GEMSTONE_LOG".to_string(),
                log_dir.join(format!("{}.log", self.name)),
            ),
            ("GEMSTONE_LOGDIR".to_string(), log_dir),
            ("GEMSTONE_DATADIR".to_string(), self.data_dir()),
            (
                "GEMSTONE_SYS_CONF".to_string(),
                self.maglev_home.join("etc").join("system.conf"),
            ),
        ]
    }

    /// Per-node environment needed by the GemStone utilities (waitstone, gslist)
    pub fn gemstone_environment(&self) -> Vec<(String, PathBuf)> {
        vec![
            ("GEMSTONE".to_string(), self.gemstone_dir()),
            ("GEMSTONE_GLOBAL_DIR".to_string(), self.maglev_home.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plan_maps_to_256() {
        assert_eq!(Plan::Free.memory(), 256);
        let record = ProvisionedService::new(Plan::Free, "/opt/maglev");
        assert_eq!(record.memory, 256);
        assert_eq!(record.pid, None);
    }

    #[test]
    fn plan_parsing_accepts_symbol_form() {
        assert_eq!("free".parse::<Plan>().unwrap(), Plan::Free);
        assert_eq!(":free".parse::<Plan>().unwrap(), Plan::Free);
        assert_eq!("FREE".parse::<Plan>().unwrap(), Plan::Free);
    }

    #[test]
    fn unknown_plan_is_rejected() {
        let err = ":enterprise".parse::<Plan>().unwrap_err();
        assert!(matches!(err, NodeError::InvalidPlan(ref p) if p == ":enterprise"));
        assert!("".parse::<Plan>().is_err());
    }

    #[test]
    fn generated_names_are_unique_and_recognizable() {
        let a = generate_name();
        let b = generate_name();
        assert_ne!(a, b);
        assert!(a.starts_with("maglev-"));
        assert!(is_generated_name(&a));
        assert!(!is_generated_name("maglev-not-a-uuid"));
        assert!(!is_generated_name("stone"));
    }

    #[test]
    fn paths_are_derived_from_home_and_name() {
        let mut record = ProvisionedService::new(Plan::Free, "/opt/maglev");
        record.name = "maglev-test".to_string();

        assert_eq!(
            record.config_file(),
            PathBuf::from("/opt/maglev/etc/conf.d/maglev-test.conf")
        );
        assert_eq!(
            record.extent_file(),
            PathBuf::from("/opt/maglev/data/maglev-test/extent/extent0.ruby.dbf")
        );
        assert_eq!(
            record.working_dir(Path::new("/var/node")),
            PathBuf::from("/var/node/maglev-test")
        );
    }

    #[test]
    fn stone_environment_is_per_instance() {
        let mut record = ProvisionedService::new(Plan::Free, "/opt/maglev");
        record.name = "maglev-a".to_string();
        let env = record.stone_environment();
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(lookup("GEMSTONE"), PathBuf::from("/opt/maglev/gemstone"));
        assert_eq!(
            lookup("GEMSTONE_LOG"),
            PathBuf::from("/opt/maglev/log/maglev-a/maglev-a.log")
        );
        assert_eq!(
            lookup("GEMSTONE_DATADIR"),
            PathBuf::from("/opt/maglev/data/maglev-a")
        );
    }
}
