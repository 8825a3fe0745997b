//! Deferred cleanup of node-local working trees
//!
//! Removing a stone's working tree is pure cleanup, so it runs on a worker
//! thread instead of the request path. Every outcome is written to the
//! instance history so failures stay visible.

use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use crate::persistence::RecordStore;

enum CleanupJob {
    RemoveDir { name: String, dir: PathBuf },
    Flush(Sender<()>),
}

/// Background remover of working directories
pub struct CleanupWorker {
    sender: Sender<CleanupJob>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupWorker {
    pub fn spawn(store: Arc<RecordStore>) -> Self {
        let (sender, receiver) = mpsc::channel::<CleanupJob>();

        let handle = std::thread::Builder::new()
            .name("maglev-cleanup".to_string())
            .spawn(move || {
                for job in receiver {
                    match job {
                        CleanupJob::RemoveDir { name, dir } => remove_dir(&store, &name, dir),
                        CleanupJob::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("Cleanup worker stopped");
            })
            .map_err(|e| error!("Failed to start cleanup worker: {}", e))
            .ok();

        Self { sender, handle }
    }

    /// Queue removal of `dir`; returns immediately
    pub fn remove_working_directory(&self, name: &str, dir: PathBuf) {
        let job = CleanupJob::RemoveDir {
            name: name.to_string(),
            dir,
        };
        if let Err(mpsc::SendError(job)) = self.sender.send(job) {
            // worker is gone; do it inline rather than leak the directory
            warn!("Cleanup worker unavailable, removing inline");
            if let CleanupJob::RemoveDir { dir, .. } = job {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!("Failed to remove {:?}: {}", dir, e);
                    }
                }
            }
        }
    }

    /// Block until every job queued so far has finished
    pub fn wait_idle(&self) {
        let (done, wait) = mpsc::channel();
        if self.sender.send(CleanupJob::Flush(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        let (closed, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.sender, closed));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn remove_dir(store: &RecordStore, name: &str, dir: PathBuf) {
    let outcome = match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };

    let recorded = match &outcome {
        Ok(()) => {
            debug!("Removed working directory {:?}", dir);
            store.record_event(name, "workdir_removed", dir.to_str())
        }
        Err(e) => {
            error!("Failed to remove working directory {:?}: {}", dir, e);
            store.record_event(name, "workdir_remove_failed", Some(&e.to_string()))
        }
    };
    if let Err(e) = recorded {
        warn!("Failed to record cleanup of {}: {}", name, e);
    }
}
