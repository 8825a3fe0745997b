//! Process supervision - Starting, verifying and signaling stone processes

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, error, info, warn};

use super::error::{NodeError, NodeResult};
use super::instance::ProvisionedService;
use super::settings::ToolConfig;
use crate::platform;

/// Starts stones and confirms they are running
#[derive(Debug, Clone)]
pub struct StoneSupervisor {
    tools: ToolConfig,
}

impl StoneSupervisor {
    pub fn new(tools: ToolConfig) -> Self {
        Self { tools }
    }

    /// Start a stone and return the pid of the running stone.
    ///
    /// The start command gets the stone's own environment on the spawned
    /// command only. Its output goes to `log_file`. The immediate child is
    /// reaped on a background thread; the stone daemonizes itself, so the
    /// returned pid comes from the process listing after the readiness
    /// wait, not from the child handle.
    pub fn start(&self, record: &ProvisionedService, log_file: &Path) -> NodeResult<u32> {
        let start_stone = self.tool(&self.tools.start_stone, record);
        info!("Starting stone {} with {:?}", record.name, start_stone);

        let open_log = || -> std::io::Result<(File, File)> {
            let log = File::create(log_file)?;
            let log_err = log.try_clone()?;
            Ok((log, log_err))
        };
        let (log, log_err) = open_log().map_err(|e| {
            NodeError::startup(&record.name, format!("cannot open log {:?}: {}", log_file, e))
        })?;

        let mut cmd = Command::new(&start_stone);
        cmd.arg(&record.name)
            .envs(record.stone_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        if let Some(dir) = log_file.parent() {
            cmd.current_dir(dir);
        }

        // Detach from our session so the stone outlives a node restart
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::startup(&record.name, format!("spawn failed: {}", e)))?;
        debug!("Start command for {} spawned as {}", record.name, child.id());

        let name = record.name.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) if status.success() => debug!("Start command for {} exited", name),
            Ok(status) => warn!("Start command for {} exited with {}", name, status),
            Err(e) => error!("Failed to reap start command for {}: {}", name, e),
        });

        let pid = self.wait_for_stone(record)?;
        info!("Stone {} started with pid {}", record.name, pid);
        Ok(pid)
    }

    /// Block until the stone reports ready, then look up its pid
    pub fn wait_for_stone(&self, record: &ProvisionedService) -> NodeResult<u32> {
        let wait_stone = self.tool(&self.tools.wait_stone, record);
        let status = self
            .gemstone_command(&wait_stone, record)?
            .arg(&record.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| NodeError::startup(&record.name, format!("waitstone failed: {}", e)))?;
        if !status.success() {
            warn!("waitstone {} exited with {}", record.name, status);
        }

        let pid = self.lookup_pid(record)?;
        if !platform::is_process_running(pid) {
            return Err(NodeError::startup(
                &record.name,
                format!("gslist returned bad pid {}", pid),
            ));
        }
        Ok(pid)
    }

    /// Ask the process listing for the stone's pid. Output that is not a
    /// number is reported as pid 0.
    pub fn lookup_pid(&self, record: &ProvisionedService) -> NodeResult<u32> {
        let list_stones = self.tool(&self.tools.list_stones, record);
        let output = self
            .gemstone_command(&list_stones, record)?
            .arg("-p")
            .arg(&record.name)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| NodeError::startup(&record.name, format!("gslist failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout.trim().parse::<u32>().unwrap_or(0);
        debug!("gslist -p {} reported {:?}", record.name, stdout.trim());
        Ok(pid)
    }

    /// Whether the recorded pid is a live process. Never fails.
    pub fn is_running(&self, record: &ProvisionedService) -> bool {
        record.pid.is_some_and(platform::is_process_running)
    }

    /// Send `signal` to the stone if it is running; otherwise do nothing
    pub fn kill(&self, record: &ProvisionedService, signal: i32) -> NodeResult<()> {
        let Some(pid) = record.pid else {
            return Ok(());
        };
        if !self.is_running(record) {
            debug!("Stone {} (pid {}) is not running", record.name, pid);
            return Ok(());
        }

        info!("Sending signal {} to stone {} (pid {})", signal, record.name, pid);
        match platform::send_signal(pid, signal) {
            Ok(()) => Ok(()),
            // exited between the liveness check and the signal
            Err(_) if !platform::is_process_running(pid) => Ok(()),
            Err(e) => Err(NodeError::cleanup(&record.name, e.to_string())),
        }
    }

    /// Forcibly stop the stone
    pub fn force_kill(&self, record: &ProvisionedService) -> NodeResult<()> {
        self.kill(record, platform::SIGKILL)
    }

    /// Ask the stone to stop
    pub fn terminate(&self, record: &ProvisionedService) -> NodeResult<()> {
        self.kill(record, platform::SIGTERM)
    }

    fn tool(&self, tool: &Path, record: &ProvisionedService) -> PathBuf {
        self.tools.resolve(tool, &record.maglev_home)
    }

    /// Command with the per-node GemStone environment; both directories
    /// must exist
    fn gemstone_command(&self, program: &Path, record: &ProvisionedService) -> NodeResult<Command> {
        let mut cmd = Command::new(program);
        for (key, value) in record.gemstone_environment() {
            if !value.exists() {
                return Err(NodeError::startup(
                    &record.name,
                    format!("${} does not exist: {:?}", key, value),
                ));
            }
            cmd.env(key, value);
        }
        Ok(cmd)
    }
}
