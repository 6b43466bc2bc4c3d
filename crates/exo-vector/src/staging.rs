//! Bounded scratch space for staging source files before they are chunked.
//!
//! The staging root is a `TempDir`, placed under `/dev/shm` when that exists so
//! staged reads come from memory. Each `ScopedRegion` reserves part of the
//! capacity up front and gives it back when dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use exo_core::config::StagingConfig;
use exo_core::error::{ExoError, Result};
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Accounting {
    used_bytes: u64,
    next_region: u64,
    free_regions: Vec<u64>,
}

#[derive(Debug)]
struct StagingInner {
    root: TempDir,
    capacity_bytes: u64,
    accounting: Mutex<Accounting>,
}

impl StagingInner {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Accounting>> {
        self.accounting
            .lock()
            .map_err(|e| ExoError::InvalidInput(format!("Lock poisoned: {}", e)))
    }
}

/// Capacity-bounded staging directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    inner: Arc<StagingInner>,
}

impl StagingArea {
    /// Create a staging root under `config.root`, or the default parent.
    pub fn new(config: &StagingConfig) -> Result<Self> {
        let parent = match &config.root {
            Some(root) => PathBuf::from(root),
            None => default_parent(),
        };
        Self::in_dir(&parent, config.capacity_bytes)
    }

    /// Create a staging root inside `parent` with the given capacity.
    pub fn in_dir(parent: &Path, capacity_bytes: u64) -> Result<Self> {
        fs::create_dir_all(parent)?;
        let root = tempfile::Builder::new()
            .prefix("exo-staging-")
            .tempdir_in(parent)?;
        info!(
            root = %root.path().display(),
            capacity_bytes,
            "Staging area ready"
        );
        Ok(Self {
            inner: Arc::new(StagingInner {
                root,
                capacity_bytes,
                accounting: Mutex::new(Accounting::default()),
            }),
        })
    }

    /// Reserve `size_hint` bytes and a private subdirectory.
    ///
    /// Fails with `StagingExhausted` when the reservation does not fit.
    pub fn acquire(&self, size_hint: u64) -> Result<ScopedRegion> {
        let id = {
            let mut acct = self.inner.lock()?;
            let available = self.inner.capacity_bytes.saturating_sub(acct.used_bytes);
            if size_hint > available {
                return Err(ExoError::StagingExhausted {
                    requested: size_hint,
                    available,
                });
            }
            acct.used_bytes += size_hint;
            match acct.free_regions.pop() {
                Some(id) => id,
                None => {
                    acct.next_region += 1;
                    acct.next_region
                }
            }
        };

        // Constructed before the directory exists so Drop returns the reservation on error.
        let region = ScopedRegion {
            inner: Arc::clone(&self.inner),
            id,
            dir: self.inner.root.path().join(format!("region-{}", id)),
            reserved_bytes: size_hint,
            written_bytes: 0,
        };
        fs::create_dir_all(&region.dir)?;
        debug!(region = id, bytes = size_hint, "Staging region acquired");
        Ok(region)
    }

    pub fn can_fit(&self, size: u64) -> bool {
        size <= self.available_bytes()
    }

    pub fn available_bytes(&self) -> u64 {
        self.inner
            .lock()
            .map(|a| self.inner.capacity_bytes.saturating_sub(a.used_bytes))
            .unwrap_or(0)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes
    }

    pub fn root(&self) -> &Path {
        self.inner.root.path()
    }
}

fn default_parent() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// A reserved slice of the staging area. Released on drop.
#[derive(Debug)]
pub struct ScopedRegion {
    inner: Arc<StagingInner>,
    id: u64,
    dir: PathBuf,
    reserved_bytes: u64,
    written_bytes: u64,
}

impl ScopedRegion {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.reserved_bytes - self.written_bytes
    }

    /// Write a file into the region, counting it against the reservation.
    pub fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.target(name)?;
        self.charge(bytes.len() as u64)?;
        fs::write(&target, bytes)?;
        Ok(target)
    }

    /// Copy an external file into the region.
    pub fn copy_in(&mut self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ExoError::InvalidInput(format!("no file name in {}", source.display()))
            })?;
        let target = self.target(name)?;
        let len = fs::metadata(source)?.len();
        self.charge(len)?;
        fs::copy(source, &target)?;
        Ok(target)
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.target(name)?)?)
    }

    fn target(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ExoError::InvalidInput(format!(
                "invalid staging file name '{}'",
                name
            )));
        }
        Ok(self.dir.join(name))
    }

    fn charge(&mut self, len: u64) -> Result<()> {
        let available = self.remaining_bytes();
        if len > available {
            return Err(ExoError::StagingExhausted {
                requested: len,
                available,
            });
        }
        self.written_bytes += len;
        Ok(())
    }
}

impl Drop for ScopedRegion {
    fn drop(&mut self) {
        if self.dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!(region = self.id, error = %e, "Failed to remove staging region");
            }
        }
        match self.inner.accounting.lock() {
            Ok(mut acct) => {
                acct.used_bytes = acct.used_bytes.saturating_sub(self.reserved_bytes);
                acct.free_regions.push(self.id);
            }
            Err(e) => warn!(region = self.id, error = %e, "Staging accounting poisoned"),
        }
        debug!(region = self.id, "Staging region released");
    }
}
