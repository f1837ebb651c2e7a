//! On-disk mirror of the packet-filter table.
//!
//! The ruleset file is rewritten after every table mutation and reloaded on
//! host boot. Writers take a sibling `.lock` file (stale after 5 minutes)
//! and replace the target via temp-then-rename, so readers never observe a
//! torn file; the previous content is kept as a `.bak` sibling.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use infinivirt_core::time;

/// A lock older than this is considered abandoned and is broken.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

const FILE_HEADER: &str = "#!/usr/sbin/nft -f";

pub struct PersistFile {
    path: PathBuf,
}

impl PersistFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        self.path.with_file_name(name)
    }

    /// Persist a ruleset snapshot: header + timestamp comment + content.
    pub fn write(&self, ruleset: &str) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("persist path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let _lock = LockGuard::acquire(self.lock_path())?;

        if self.path.exists() {
            if let Err(e) = fs::copy(&self.path, self.backup_path()) {
                warn!(error = %e, "failed to write ruleset backup");
            }
        }

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        writeln!(tmp, "{}", FILE_HEADER)?;
        writeln!(tmp, "# infinivirt ruleset snapshot {}", time::utc_now())?;
        writeln!(tmp)?;
        tmp.write_all(ruleset.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), "ruleset persisted");
        Ok(())
    }

    /// Read the persisted ruleset after a structural validity check.
    pub fn read_validated(&self) -> Result<String> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        validate(&content)?;
        Ok(content)
    }
}

/// Structural validity: the table declaration and the base chain must both
/// be present. Anything less is a partial or foreign file.
pub fn validate(content: &str) -> Result<()> {
    if !content.contains("table bridge infinivirt") {
        bail!("persisted ruleset is missing the table declaration");
    }
    if !content.lines().any(|l| l.trim_start().starts_with("chain forward")) {
        bail!("persisted ruleset is missing the forward chain");
    }
    Ok(())
}

struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: PathBuf) -> Result<Self> {
        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut f) => {
                    let _ = writeln!(f, "{} {}", std::process::id(), time::utc_now());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .is_some_and(|age| age > LOCK_STALE_AFTER);
                    if stale && attempt == 0 {
                        warn!(lock = %path.display(), "breaking stale ruleset lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    bail!("ruleset lock {} is held", path.display());
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock {}", path.display()));
                }
            }
        }
        bail!("ruleset lock {} is held", path.display());
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ruleset() -> &'static str {
        "table bridge infinivirt {\n\tchain forward {\n\t\ttype filter hook forward priority 0; policy accept;\n\t}\n}\n"
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = PersistFile::new(dir.path().join("infinivirt.nft"));

        file.write(sample_ruleset()).unwrap();
        let content = file.read_validated().unwrap();
        assert!(content.starts_with(FILE_HEADER));
        assert!(content.contains("table bridge infinivirt"));
    }

    #[test]
    fn test_rewrite_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let file = PersistFile::new(dir.path().join("infinivirt.nft"));

        file.write(sample_ruleset()).unwrap();
        file.write(sample_ruleset()).unwrap();
        assert!(dir.path().join("infinivirt.nft.bak").exists());
    }

    #[test]
    fn test_lock_released_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = PersistFile::new(dir.path().join("infinivirt.nft"));
        file.write(sample_ruleset()).unwrap();
        assert!(!dir.path().join("infinivirt.nft.lock").exists());
    }

    #[test]
    fn test_held_lock_blocks_writer() {
        let dir = tempfile::tempdir().unwrap();
        let file = PersistFile::new(dir.path().join("infinivirt.nft"));
        // A fresh lock file (not stale) must block the write.
        fs::write(dir.path().join("infinivirt.nft.lock"), "held").unwrap();
        assert!(file.write(sample_ruleset()).is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_content() {
        assert!(validate(sample_ruleset()).is_ok());
        assert!(validate("table ip nat {}").is_err());
        assert!(validate("table bridge infinivirt {\n}").is_err());
    }
}
