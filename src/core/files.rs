//! Stone files - Repository creation/removal and node-local working trees

use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use super::error::{NodeError, NodeResult};
use super::instance::ProvisionedService;
use super::settings::ToolConfig;

/// Lays down and removes the on-disk state of stones
#[derive(Debug, Clone)]
pub struct StoneFiles {
    /// Root of the node-local working trees
    base_dir: PathBuf,
    tools: ToolConfig,
}

impl StoneFiles {
    pub fn new(base_dir: impl Into<PathBuf>, tools: ToolConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            tools,
        }
    }

    /// Create the stone's config file and repository unless either already
    /// exists. The primary extent must be present afterwards.
    pub fn create(&self, record: &ProvisionedService) -> NodeResult<()> {
        if !record.config_file().exists() && !record.extent_file().exists() {
            let status = self
                .run_rake(record, &format!("stone:create[{}]", record.name))
                .map_err(|e| NodeError::files(&record.name, e.to_string()))?;
            if !status.success() {
                warn!("stone:create for {} exited with {}", record.name, status);
            }
        } else {
            debug!("Stone files for {} already present", record.name);
        }

        if !record.extent_file().exists() {
            return Err(NodeError::files(
                &record.name,
                format!("missing {}", record.extent_file().display()),
            ));
        }

        info!("Stone files ready for {}", record.name);
        Ok(())
    }

    /// Blow away the stone's repository. The stone should already be
    /// stopped. Absence of the files is not verified; the tool's exit status
    /// is returned for the caller to record.
    pub fn destroy(&self, record: &ProvisionedService) -> NodeResult<ExitStatus> {
        let status = self.run_rake(record, &format!("stone:destroy[{}]", record.name))?;
        if status.success() {
            debug!("stone:destroy for {} finished", record.name);
        } else {
            warn!("stone:destroy for {} exited with {}", record.name, status);
        }
        Ok(status)
    }

    /// Create `<base_dir>/<name>/data` and return the log file path inside
    /// the working tree
    pub fn create_working_directory(&self, record: &ProvisionedService) -> NodeResult<PathBuf> {
        let dir = record.working_dir(&self.base_dir);
        std::fs::create_dir_all(dir.join("data"))?;
        Ok(dir.join("log"))
    }

    /// Node-local working tree of a stone
    pub fn working_directory(&self, record: &ProvisionedService) -> PathBuf {
        record.working_dir(&self.base_dir)
    }

    fn run_rake(&self, record: &ProvisionedService, task: &str) -> std::io::Result<ExitStatus> {
        let rake = self.tools.resolve(&self.tools.rake, &record.maglev_home);
        debug!("Running {:?} {} in {:?}", rake, task, record.maglev_home);

        let output = Command::new(&rake)
            .arg(task)
            .current_dir(&record.maglev_home)
            .env("MAGLEV_HOME", &record.maglev_home)
            .stdin(Stdio::null())
            .output()?;

        if !output.stdout.is_empty() {
            debug!("{}: {}", task, String::from_utf8_lossy(&output.stdout).trim_end());
        }
        if !output.stderr.is_empty() {
            debug!("{} stderr: {}", task, String::from_utf8_lossy(&output.stderr).trim_end());
        }

        Ok(output.status)
    }
}
