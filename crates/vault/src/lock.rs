//! Per-entity advisory locks under `{vault_root}/.locks/`.
//!
//! All mutations of an entity are serialized by an exclusive `fs2` lock
//! on `{id}.lock`, held across the read-modify-write.  Acquisition is
//! bounded; hitting the budget surfaces `LockTimeout`, which bus
//! handlers treat as retryable.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use kira_core::error::{KiraError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive hold on one entity id.  Released on drop.
#[derive(Debug)]
pub struct EntityLock {
    file: File,
    id: String,
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(id = %self.id, error = %err, "failed to release entity lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    timeout: Duration,
}

impl LockManager {
    pub fn new(vault_root: &Path, timeout: Duration) -> Self {
        Self {
            locks_dir: vault_root.join(".locks"),
            timeout,
        }
    }

    /// Acquire the exclusive lock for `id`, polling up to the timeout.
    pub fn acquire(&self, id: &str) -> Result<EntityLock> {
        fs::create_dir_all(&self.locks_dir)?;
        let path = self.locks_dir.join(format!("{id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(EntityLock {
                        file,
                        id: id.to_string(),
                    });
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= self.timeout {
                        return Err(KiraError::LockTimeout {
                            id: id.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
