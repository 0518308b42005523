//! Physical copies of the database file and its WAL companions.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StorageError;

pub const BACKUP_MANIFEST_FILE: &str = "backup_manifest.json";

const COMPANION_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupManifest {
    pub label: String,
    pub created_at: String,
    pub source: PathBuf,
    /// File name to blake3 hex digest.
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    retain: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `db_path` and any `-wal`/`-shm` files next to it into a fresh
    /// `<timestamp>-<label>` directory, then re-hash the copies against the
    /// sources.
    pub fn create(&self, db_path: &Path, label: &str) -> Result<PathBuf, StorageError> {
        if !db_path.is_file() {
            return Err(StorageError::NotFound(format!(
                "database file {}",
                db_path.display()
            )));
        }
        fs::create_dir_all(&self.dir)?;
        let now = chrono::Utc::now();
        let target = self.fresh_dir(&format!("{}-{label}", now.format("%Y%m%dT%H%M%S%3f")))?;

        let mut files = BTreeMap::new();
        for source in companions(db_path) {
            let Some(name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let digest = hash_file(&source)?;
            fs::copy(&source, target.join(&name))?;
            files.insert(name, digest);
        }

        let manifest = BackupManifest {
            label: label.to_string(),
            created_at: now.to_rfc3339(),
            source: db_path.to_path_buf(),
            files,
        };
        fs::write(
            target.join(BACKUP_MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        self.verify(&target)?;
        info!(path = %target.display(), files = manifest.files.len(), "backup written");
        Ok(target)
    }

    pub fn load_manifest(&self, backup: &Path) -> Result<BackupManifest, StorageError> {
        let bytes = fs::read(backup.join(BACKUP_MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-hash every file listed in the manifest.
    pub fn verify(&self, backup: &Path) -> Result<(), StorageError> {
        let manifest = self.load_manifest(backup)?;
        for (name, expected) in &manifest.files {
            let actual = hash_file(&backup.join(name))?;
            if &actual != expected {
                return Err(StorageError::Corrupt(format!(
                    "backup file {name} in {} does not match its manifest",
                    backup.display()
                )));
            }
        }
        Ok(())
    }

    /// Backup directories oldest first. Only directories carrying a manifest
    /// are considered.
    pub fn list(&self) -> Result<Vec<PathBuf>, StorageError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() && path.join(BACKUP_MANIFEST_FILE).is_file() {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete all but the newest `retain` backups; returns what was removed.
    pub fn rotate(&self) -> Result<Vec<PathBuf>, StorageError> {
        let all = self.list()?;
        let excess = all.len().saturating_sub(self.retain);
        let mut removed = Vec::with_capacity(excess);
        for path in all.into_iter().take(excess) {
            match fs::remove_dir_all(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old backup"),
            }
        }
        Ok(removed)
    }

    fn fresh_dir(&self, base: &str) -> Result<PathBuf, StorageError> {
        let mut candidate = self.dir.join(base);
        let mut n = 1;
        loop {
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = self.dir.join(format!("{base}.{n}"));
                    n += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn companions(db_path: &Path) -> Vec<PathBuf> {
    let mut out = vec![db_path.to_path_buf()];
    for suffix in COMPANION_SUFFIXES {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        let path = PathBuf::from(name);
        if path.is_file() {
            out.push(path);
        }
    }
    out
}

pub fn hash_file(path: &Path) -> Result<String, StorageError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
