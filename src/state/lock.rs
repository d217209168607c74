//! Run-scoped lock file.
//!
//! Acquisition creates the lock file with `create_new`, so only one process
//! can succeed. A lock older than the stale threshold is assumed to belong to
//! a crashed run and is taken over. Dropping the guard removes the file.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Guard for the run lock. The lock is released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` when another live run holds it.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        match Self::create(path) {
            Ok(lock) => return Ok(Some(lock)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let Some(age) = lock_age(path)? else {
            // Holder released it between our attempts.
            return Self::create(path).map(Some).or_else(contended);
        };

        if age < stale_after {
            debug!("Lock {} held for {}s", path.display(), age.as_secs());
            return Ok(None);
        }

        warn!(
            "Taking over stale lock {} (age {}s)",
            path.display(),
            age.as_secs()
        );
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Self::create(path).map(Some).or_else(contended)
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        writeln!(file, "{}", Utc::now().to_rfc3339())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn contended(e: io::Error) -> io::Result<Option<RunLock>> {
    if e.kind() == io::ErrorKind::AlreadyExists {
        Ok(None)
    } else {
        Err(e)
    }
}

/// Age of an existing lock, from its recorded acquisition time or, failing
/// that, the file's modification time. `None` if the file is gone.
fn lock_age(path: &Path) -> io::Result<Option<Duration>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let recorded = content
        .lines()
        .nth(1)
        .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let age = match recorded {
        Some(acquired_at) => (Utc::now() - acquired_at).to_std().unwrap_or_default(),
        None => fs::metadata(path)?
            .modified()?
            .elapsed()
            .unwrap_or_default(),
    };
    Ok(Some(age))
}
