use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::model::LockRecord;
use crate::pipeline::error::PipelineError;
use crate::util::{
    ensure_directory, now_utc_string, read_json, remove_file_if_exists, staging_sibling,
};

/// Exclusive run token backed by a lock file.
///
/// Dropping the guard removes the file, so every exit path of a run (early
/// return, error, panic unwind) releases it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: String,
    released: bool,
}

impl RunLock {
    pub fn acquire(path: &Path, run_id: &str, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }

        let record = LockRecord {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            acquired_at: now_utc_string(),
        };

        // One takeover attempt at most: a second AlreadyExists means another
        // run won the race for the stale lock.
        for attempt in 0..2 {
            match try_create(path, &record) {
                Ok(()) => {
                    info!(path = %path.display(), run_id, "run lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        run_id: run_id.to_string(),
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_holder(path);
                    if attempt == 0 && is_stale(&holder, stale_after) {
                        warn!(
                            path = %path.display(),
                            holder = %holder.run_id,
                            acquired_at = %holder.acquired_at,
                            "taking over stale run lock"
                        );
                        match take_over_stale(path, &holder, run_id)? {
                            None => continue,
                            Some(current) => return Err(lock_held(path, current)),
                        }
                    }

                    return Err(lock_held(path, holder));
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create lock {}", path.display()));
                }
            }
        }

        Err(lock_held(path, read_holder(path)))
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let holder = read_holder(&self.path);
        if holder.run_id != self.run_id && holder.run_id != UNKNOWN_HOLDER {
            warn!(
                path = %self.path.display(),
                holder = %holder.run_id,
                run_id = %self.run_id,
                "run lock now belongs to another run; leaving it in place"
            );
            return Ok(());
        }

        if remove_file_if_exists(&self.path)? {
            info!(path = %self.path.display(), run_id = %self.run_id, "run lock released");
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

const UNKNOWN_HOLDER: &str = "unknown";

fn try_create(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let data = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    file.write_all(&data)?;
    file.sync_all()
}

pub fn read_holder(path: &Path) -> LockRecord {
    read_json::<LockRecord>(path).unwrap_or_else(|_| LockRecord {
        run_id: UNKNOWN_HOLDER.to_string(),
        pid: 0,
        acquired_at: modified_at(path).unwrap_or_default(),
    })
}

fn lock_held(path: &Path, holder: LockRecord) -> anyhow::Error {
    PipelineError::LockHeld {
        path: path.to_path_buf(),
        holder: holder.run_id,
        acquired_at: holder.acquired_at,
    }
    .into()
}

fn same_holder(left: &LockRecord, right: &LockRecord) -> bool {
    left.run_id == right.run_id && left.pid == right.pid && left.acquired_at == right.acquired_at
}

/// Moves the lock file aside and keeps it out only when it is still the
/// `stale` record. Returns the holder found instead when another run got there
/// first; its file is linked back into place.
fn take_over_stale(path: &Path, stale: &LockRecord, run_id: &str) -> Result<Option<LockRecord>> {
    let aside = staging_sibling(path, &format!("takeover-{run_id}-{}", std::process::id()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to move stale lock {}", path.display()));
        }
    }

    let moved = read_holder(&aside);
    if same_holder(&moved, stale) {
        remove_file_if_exists(&aside)?;
        return Ok(None);
    }

    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            warn!(
                path = %path.display(),
                holder = %moved.run_id,
                "lock was replaced while restoring it"
            );
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to restore lock {}", path.display()));
        }
    }
    remove_file_if_exists(&aside)?;
    Ok(Some(moved))
}

fn modified_at(path: &Path) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let ts: DateTime<Utc> = modified.into();
    Some(ts.to_rfc3339())
}

fn is_stale(holder: &LockRecord, stale_after: Duration) -> bool {
    let Ok(acquired_at) = DateTime::parse_from_rfc3339(&holder.acquired_at) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(acquired_at.with_timezone(&Utc));
    age.to_std().map(|age| age > stale_after).unwrap_or(false)
}
