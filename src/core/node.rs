//! Node controller - The only entry point the broker talks to

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::cleanup::CleanupWorker;
use super::error::{NodeError, NodeResult};
use super::files::StoneFiles;
use super::instance::{Plan, ProvisionedService};
use super::process::StoneSupervisor;
use super::resource::MemoryLedger;
use super::settings::NodeConfig;
use crate::persistence::{HistoryEvent, RecordStore};

/// Capacity advertised to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub available_memory: i64,
}

/// Result of a successful provision; stored by the broker and handed back
/// on later requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub hostname: String,
    pub name: String,
    pub pid: u32,
}

/// Connection details returned by bind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindResponse {
    pub hostname: String,
    pub stonename: String,
}

/// Provisions, supervises and tears down stones on this host
pub struct Node {
    config: NodeConfig,
    maglev_home: PathBuf,
    store: Arc<RecordStore>,
    ledger: Mutex<MemoryLedger>,
    supervisor: StoneSupervisor,
    files: StoneFiles,
    cleanup: CleanupWorker,
}

impl Node {
    /// Open the record store and restart every stone it knows about.
    ///
    /// Stones that fail to restart are logged and left in the store; they
    /// hold no memory, so unprovisioning them later credits nothing.
    pub fn initialize(config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;
        let maglev_home = config.get_maglev_home()?.to_path_buf();

        let base_dir = config.get_base_dir();
        std::fs::create_dir_all(&base_dir)?;

        let store = RecordStore::open(&config.get_local_db())?;
        store.initialize()?;
        if let Err(e) = store.cleanup_history(config.history_retention_days) {
            warn!("Failed to clean up instance history: {}", e);
        }
        let store = Arc::new(store);

        let node = Self {
            maglev_home,
            ledger: Mutex::new(MemoryLedger::new(config.available_memory)),
            supervisor: StoneSupervisor::new(config.tools.clone()),
            files: StoneFiles::new(base_dir, config.tools.clone()),
            cleanup: CleanupWorker::spawn(Arc::clone(&store)),
            store,
            config,
        };

        node.reconcile()?;
        info!(
            "Node {} ready with {} memory available",
            node.config.node_id,
            node.available_memory()
        );
        Ok(node)
    }

    /// Restart persisted stones and rebuild the memory ledger from the ones
    /// that came back
    fn reconcile(&self) -> NodeResult<()> {
        let (records, invalid) = self.store.all_lenient()?;
        let mut charges = Vec::new();

        for (name, e) in invalid {
            self.record_event(&name, "restart_failed", Some(&e.to_string()));
        }

        for mut record in records {
            match self.restart(&mut record) {
                Ok(()) => {
                    charges.push((record.name.clone(), record.memory));
                    self.record_event(&record.name, "restarted", pid_detail(&record).as_deref());
                }
                Err(e) => {
                    warn!("Failed to restart stone {}: {}", record.name, e);
                    self.record_event(&record.name, "restart_failed", Some(&e.to_string()));
                }
            }
        }

        self.ledger().reconcile(charges);
        Ok(())
    }

    fn restart(&self, record: &mut ProvisionedService) -> NodeResult<()> {
        // A stone that survived the node restart is adopted as is
        if let Ok(pid) = self.supervisor.lookup_pid(record) {
            if crate::platform::is_process_running(pid) {
                debug!("Stone {} already running with pid {}", record.name, pid);
                record.pid = Some(pid);
                self.store.save(record)?;
                return Ok(());
            }
        }

        let log_file = self.files.create_working_directory(record)?;
        let pid = self.supervisor.start(record, &log_file)?;
        record.pid = Some(pid);
        self.store.save(record)?;
        Ok(())
    }

    /// Current capacity. No side effects.
    pub fn announcement(&self) -> Announcement {
        Announcement {
            available_memory: self.available_memory(),
        }
    }

    pub fn available_memory(&self) -> i64 {
        self.ledger().available()
    }

    /// Create and start a new stone for `plan`.
    ///
    /// Memory is reserved before anything else is created and handed back
    /// if any later step fails; whatever was created is rolled back.
    pub fn provision(&self, plan: &str) -> NodeResult<ProvisionResponse> {
        let start_time = Instant::now();
        let plan: Plan = plan.parse()?;

        let mut record = ProvisionedService::new(plan, &self.maglev_home);
        self.ledger().reserve(&record.name, record.memory)?;

        if let Err(e) = self.realize(&mut record) {
            self.ledger().release(&record.name);
            warn!("Provisioning {} failed: {}", record.name, e);
            if let Err(cleanup_err) = self.cleanup_service(&record) {
                error!("Rollback of {} incomplete: {}", record.name, cleanup_err);
            }
            self.record_event(&record.name, "provision_failed", Some(&e.to_string()));
            return Err(e);
        }

        let response = ProvisionResponse {
            hostname: self.config.local_ip.clone(),
            name: record.name.clone(),
            pid: record.pid.unwrap_or_default(),
        };
        self.record_event(&record.name, "provisioned", pid_detail(&record).as_deref());
        info!(
            "Provisioned {} (plan {}, memory {}) in {:?}",
            record.name,
            record.plan,
            record.memory,
            start_time.elapsed()
        );
        debug!("provision(): response: {:?}", response);
        Ok(response)
    }

    /// Files, process, then the record. The record only becomes durable
    /// once the stone is confirmed running.
    fn realize(&self, record: &mut ProvisionedService) -> NodeResult<()> {
        self.files.create(record)?;
        let log_file = self.files.create_working_directory(record)?;
        let pid = self.supervisor.start(record, &log_file)?;
        record.pid = Some(pid);
        self.store.save(record)?;
        Ok(())
    }

    /// Tear a stone down and return its memory to the pool
    pub fn unprovision(&self, name: &str, bindings: &[Value]) -> NodeResult<()> {
        debug!("Unprovision request: name={}, bindings={}", name, bindings.len());
        let record = self
            .store
            .get(name)?
            .ok_or_else(|| NodeError::NotFound(name.to_string()))?;

        let cleaned = self.cleanup_service(&record);
        // once the record is gone the stone no longer holds its memory
        let credited = match cleaned {
            Err(NodeError::Persistence(_)) => 0,
            _ => self.ledger().release(name),
        };
        cleaned?;

        self.record_event(name, "unprovisioned", Some(&format!("released {}", credited)));
        info!("Successfully fulfilled unprovision request: {}", name);
        Ok(())
    }

    /// Remove the record, kill the stone, destroy its files and queue
    /// removal of its working tree.
    ///
    /// Failing to remove the record aborts immediately. Later steps all run
    /// even if one fails; the first failure is returned. Completed steps are
    /// never undone.
    fn cleanup_service(&self, record: &ProvisionedService) -> NodeResult<()> {
        debug!("Killing {} started with pid {:?}", record.name, record.pid);
        self.store.destroy(&record.name)?;

        let mut first_error = None;

        if let Err(e) = self.supervisor.force_kill(record) {
            warn!("Failed to kill {}: {}", record.name, e);
            first_error.get_or_insert(e);
        }

        match self.files.destroy(record) {
            Ok(status) => {
                self.record_event(&record.name, "files_destroyed", Some(&status.to_string()))
            }
            Err(e) => {
                warn!("Failed to destroy files of {}: {}", record.name, e);
                self.record_event(&record.name, "files_destroy_failed", Some(&e.to_string()));
                first_error.get_or_insert(NodeError::cleanup(&record.name, e.to_string()));
            }
        }

        self.cleanup
            .remove_working_directory(&record.name, self.files.working_directory(record));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connection details for a stone, derived from its record only.
    /// Distinguishes unknown stones from internal failures.
    pub fn try_bind(&self, name: &str, bind_opts: &Value) -> NodeResult<BindResponse> {
        debug!("Bind request: name={}, bind_opts={}", name, bind_opts);
        let record = self
            .store
            .get(name)?
            .ok_or_else(|| NodeError::NotFound(name.to_string()))?;

        let response = BindResponse {
            hostname: self.config.local_ip.clone(),
            stonename: record.name,
        };
        debug!("response: {:?}", response);
        Ok(response)
    }

    /// Broker-facing bind: any failure is logged and reported as `None`
    pub fn bind(&self, name: &str, bind_opts: &Value) -> Option<BindResponse> {
        self.try_bind(name, bind_opts)
            .map_err(|e| warn!("Bind of {} failed: {}", name, e))
            .ok()
    }

    /// Check that the stone named in `credentials` exists. Nothing to revoke.
    pub fn try_unbind(&self, credentials: &Value) -> NodeResult<()> {
        debug!("Unbind request: credentials={}", credentials);
        let name = credentials
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::NotFound(credentials.to_string()))?;

        self.store
            .get(name)?
            .ok_or_else(|| NodeError::NotFound(name.to_string()))?;

        debug!("Successfully unbind {}", credentials);
        Ok(())
    }

    /// Broker-facing unbind: any failure is logged and reported as `None`
    pub fn unbind(&self, credentials: &Value) -> Option<()> {
        self.try_unbind(credentials)
            .map_err(|e| warn!("Unbind failed: {}", e))
            .ok()
    }

    /// Stop every stone. Records and files are left in place so the next
    /// start can bring the stones back.
    pub fn shutdown(&self) {
        info!("Shutting down instances..");
        match self.store.all_lenient() {
            Ok((records, invalid)) => {
                for (name, e) in invalid {
                    warn!("Cannot stop {}: {}", name, e);
                }
                for record in records {
                    debug!(
                        "pid: {:?} running?: {}",
                        record.pid,
                        self.supervisor.is_running(&record)
                    );
                    if let Err(e) = self.supervisor.terminate(&record) {
                        warn!("Failed to stop {}: {}", record.name, e);
                    } else {
                        self.record_event(&record.name, "stopped", None);
                    }
                }
            }
            Err(e) => error!("Failed to load records during shutdown: {}", e),
        }
        self.cleanup.wait_idle();
    }

    /// All persisted stones that decode; undecodable rows are logged
    pub fn records(&self) -> NodeResult<Vec<ProvisionedService>> {
        Ok(self.store.all_lenient()?.0)
    }

    /// Lifecycle events recorded for a stone
    pub fn history(&self, name: &str) -> NodeResult<Vec<HistoryEvent>> {
        Ok(self.store.history(name)?)
    }

    /// Whether the stone's recorded pid is alive
    pub fn is_running(&self, record: &ProvisionedService) -> bool {
        self.supervisor.is_running(record)
    }

    /// Block until queued working-tree removals have finished
    pub fn wait_for_cleanup(&self) {
        self.cleanup.wait_idle();
    }

    fn ledger(&self) -> MutexGuard<'_, MemoryLedger> {
        // a plain counter is still consistent after a panic elsewhere
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_event(&self, name: &str, event_type: &str, details: Option<&str>) {
        if let Err(e) = self.store.record_event(name, event_type, details) {
            warn!("Failed to record {} event for {}: {}", event_type, name, e);
        }
    }
}

fn pid_detail(record: &ProvisionedService) -> Option<String> {
    record.pid.map(|pid| format!("pid {}", pid))
}
