//! Handoff of issued material to the consumer's directory.
//!
//! The consumer (an IRC daemon) reads `fullchain.pem` and `privkey.pem`
//! from its own directory; we never point it at the store. Each handoff
//! writes a complete bundle into a fresh versioned directory under
//! `bundles/` and then repoints the `current` symlink with a single
//! rename. `fullchain.pem`, `privkey.pem` and the issued marker are
//! stable symlinks through `current`, so the consumer always resolves
//! the chain and the key from the same bundle. An interrupted handoff
//! leaves `current` on the previous bundle, which is still complete on
//! disk. Stale bundle directories are pruned after a successful swap.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::errors::{Classify, ErrorClass};
use crate::store::CertificateBundle;

pub const CHAIN_FILE: &str = "fullchain.pem";
pub const KEY_FILE: &str = "privkey.pem";
/// Marker recording when material was last handed off.
pub const ISSUED_MARKER: &str = ".issued";

/// Versioned bundle directories live here, inside the target directory.
const BUNDLES_DIR: &str = "bundles";
/// Symlink naming the live bundle directory.
const CURRENT_LINK: &str = "current";

#[derive(Debug, Error)]
pub enum PropagateError {
    #[error("Failed to write certificate material to '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Target directory '{path}' not writable after {attempts} attempts")]
    TargetUnavailable { path: PathBuf, attempts: u32 },
}

impl Classify for PropagateError {
    fn class(&self) -> ErrorClass {
        match self {
            PropagateError::Io { .. } => ErrorClass::Transient,
            PropagateError::TargetUnavailable { .. } => ErrorClass::Timeout,
        }
    }
}

pub struct SyncPropagator {
    target_dir: PathBuf,
    backoff: BackoffPolicy,
}

impl SyncPropagator {
    pub fn new(target_dir: impl Into<PathBuf>, backoff: BackoffPolicy) -> Self {
        Self {
            target_dir: target_dir.into(),
            backoff,
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Hand a bundle off to the target directory.
    pub async fn propagate(&self, bundle: &CertificateBundle) -> Result<(), PropagateError> {
        self.wait_for_target().await?;

        let bundles = self.target_dir.join(BUNDLES_DIR);
        fs::create_dir_all(&bundles).map_err(|e| io_at(&bundles, e))?;

        let name = format!(
            "bundle-{}-{:08x}",
            Utc::now().timestamp(),
            rand::random::<u32>()
        );
        let staged = bundles.join(&name);
        fs::create_dir(&staged).map_err(|e| io_at(&staged, e))?;
        write_file(&staged.join(CHAIN_FILE), bundle.chain_pem.as_bytes(), 0o644)?;
        write_file(&staged.join(KEY_FILE), bundle.key_pem.as_bytes(), 0o600)?;
        write_file(
            &staged.join(ISSUED_MARKER),
            bundle.issued_at.to_rfc3339().as_bytes(),
            0o644,
        )?;

        // The swap is one rename of the `current` symlink, so the chain
        // and the key always come from the same bundle directory.
        self.swap_link(
            self.target_dir.join(CURRENT_LINK),
            PathBuf::from(BUNDLES_DIR).join(&name),
        )?;
        self.ensure_entry_link(CHAIN_FILE)?;
        self.ensure_entry_link(KEY_FILE)?;
        self.ensure_entry_link(ISSUED_MARKER)?;
        self.prune_stale_bundles(&bundles, &name);

        info!(
            primary = bundle.primary(),
            target = %self.target_dir.display(),
            bundle_dir = %name,
            "certificate material propagated"
        );
        Ok(())
    }

    /// True once material has been handed off to this target at least once.
    pub fn has_installed_material(&self) -> bool {
        self.target_dir.join(ISSUED_MARKER).exists()
            && self.target_dir.join(CHAIN_FILE).exists()
            && self.target_dir.join(KEY_FILE).exists()
    }

    /// Atomically point `link` at `dest` by renaming a staged symlink
    /// over it. Rename replaces an existing symlink or regular file in
    /// one step.
    fn swap_link(&self, link: PathBuf, dest: PathBuf) -> Result<(), PropagateError> {
        let tmp = self
            .target_dir
            .join(format!(".certpilot-{:08x}", rand::random::<u32>()));
        symlink(&dest, &tmp).map_err(|e| io_at(&tmp, e))?;
        fs::rename(&tmp, &link).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_at(&link, e)
        })
    }

    /// Entry links are created once; later handoffs only repoint
    /// `current`.
    fn ensure_entry_link(&self, name: &str) -> Result<(), PropagateError> {
        let entry = self.target_dir.join(name);
        let dest = PathBuf::from(CURRENT_LINK).join(name);
        if fs::read_link(&entry).map(|t| t == dest).unwrap_or(false) {
            return Ok(());
        }
        self.swap_link(entry, dest)
    }

    /// Best-effort removal of bundle directories the swap left behind.
    fn prune_stale_bundles(&self, bundles: &Path, keep: &str) {
        let entries = match fs::read_dir(bundles) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %bundles.display(), error = %e, "failed to list bundle directories");
                return;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            let path = entry.path();
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale bundle");
            } else {
                debug!(path = %path.display(), "removed stale bundle");
            }
        }
    }

    /// Wait for the target directory to exist and be writable. The
    /// consumer may still be starting up (it creates its own config
    /// directory), so this polls under the configured backoff budget.
    async fn wait_for_target(&self) -> Result<(), PropagateError> {
        let attempts = self.backoff.max_attempts();
        for attempt in 1..=attempts {
            if self.target_writable() {
                return Ok(());
            }
            if attempt < attempts {
                let delay = self.backoff.delay_for(attempt);
                debug!(
                    target = %self.target_dir.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "target directory not ready"
                );
                tokio::time::sleep(delay).await;
            }
        }
        warn!(
            target = %self.target_dir.display(),
            attempts,
            "giving up waiting for target directory"
        );
        Err(PropagateError::TargetUnavailable {
            path: self.target_dir.clone(),
            attempts,
        })
    }

    fn target_writable(&self) -> bool {
        if !self.target_dir.is_dir() {
            return false;
        }
        // A probe write catches read-only mounts that a metadata check
        // would miss.
        tempfile::Builder::new()
            .prefix(".certpilot-probe-")
            .tempfile_in(&self.target_dir)
            .is_ok()
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), PropagateError> {
    use std::io::Write;

    let mut file = fs::File::create(path).map_err(|e| io_at(path, e))?;
    file.write_all(contents).map_err(|e| io_at(path, e))?;
    file.sync_all().map_err(|e| io_at(path, e))?;
    set_mode(path, mode).map_err(|e| io_at(path, e))?;
    Ok(())
}

fn io_at(path: &Path, source: std::io::Error) -> PropagateError {
    PropagateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(_original: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlink handoff requires a unix target",
    ))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bundle() -> CertificateBundle {
        CertificateBundle {
            domains: vec!["irc.example.com".into()],
            chain_pem: "new chain".into(),
            key_pem: "new key".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(90),
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_propagate_writes_all_files() {
        let target = TempDir::new().unwrap();
        let propagator = SyncPropagator::new(target.path(), fast_backoff());

        propagator.propagate(&bundle()).await.unwrap();

        assert_eq!(
            fs::read_to_string(target.path().join(CHAIN_FILE)).unwrap(),
            "new chain"
        );
        assert_eq!(
            fs::read_to_string(target.path().join(KEY_FILE)).unwrap(),
            "new key"
        );
        assert!(target.path().join(ISSUED_MARKER).exists());
        assert!(propagator.has_installed_material());
    }

    #[tokio::test]
    async fn test_propagate_replaces_previous_material() {
        let target = TempDir::new().unwrap();
        fs::write(target.path().join(CHAIN_FILE), "old chain").unwrap();
        fs::write(target.path().join(KEY_FILE), "old key").unwrap();

        let propagator = SyncPropagator::new(target.path(), fast_backoff());
        propagator.propagate(&bundle()).await.unwrap();

        assert_eq!(
            fs::read_to_string(target.path().join(CHAIN_FILE)).unwrap(),
            "new chain"
        );
        assert_eq!(
            fs::read_to_string(target.path().join(KEY_FILE)).unwrap(),
            "new key"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_renewal_repoints_one_link_for_the_whole_bundle() {
        let target = TempDir::new().unwrap();
        let propagator = SyncPropagator::new(target.path(), fast_backoff());

        propagator.propagate(&bundle()).await.unwrap();
        let chain_link = fs::read_link(target.path().join(CHAIN_FILE)).unwrap();
        let key_link = fs::read_link(target.path().join(KEY_FILE)).unwrap();
        let first_current = fs::read_link(target.path().join(CURRENT_LINK)).unwrap();

        let mut renewed = bundle();
        renewed.chain_pem = "renewed chain".into();
        renewed.key_pem = "renewed key".into();
        propagator.propagate(&renewed).await.unwrap();

        // The entry links never move; the renewal repointed `current`.
        assert_eq!(
            fs::read_link(target.path().join(CHAIN_FILE)).unwrap(),
            chain_link
        );
        assert_eq!(
            fs::read_link(target.path().join(KEY_FILE)).unwrap(),
            key_link
        );
        assert_ne!(
            fs::read_link(target.path().join(CURRENT_LINK)).unwrap(),
            first_current
        );

        // The chain and the key resolve into the same bundle directory.
        let chain_real = fs::canonicalize(target.path().join(CHAIN_FILE)).unwrap();
        let key_real = fs::canonicalize(target.path().join(KEY_FILE)).unwrap();
        assert_eq!(chain_real.parent(), key_real.parent());
        assert_eq!(fs::read_to_string(&chain_real).unwrap(), "renewed chain");
        assert_eq!(fs::read_to_string(&key_real).unwrap(), "renewed key");
    }

    #[tokio::test]
    async fn test_stale_bundles_are_pruned() {
        let target = TempDir::new().unwrap();
        let propagator = SyncPropagator::new(target.path(), fast_backoff());

        propagator.propagate(&bundle()).await.unwrap();
        propagator.propagate(&bundle()).await.unwrap();

        let dirs: Vec<_> = fs::read_dir(target.path().join(BUNDLES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(dirs.len(), 1);
    }

    #[tokio::test]
    async fn test_no_temporaries_left_behind() {
        let target = TempDir::new().unwrap();
        let propagator = SyncPropagator::new(target.path(), fast_backoff());
        propagator.propagate(&bundle()).await.unwrap();

        let leftovers: Vec<_> = fs::read_dir(target.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".certpilot-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_permissions_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let target = TempDir::new().unwrap();
        let propagator = SyncPropagator::new(target.path(), fast_backoff());
        propagator.propagate(&bundle()).await.unwrap();

        let mode = fs::metadata(target.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
        let mode = fs::metadata(target.path().join(CHAIN_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_times_out_with_bounded_attempts() {
        let parent = TempDir::new().unwrap();
        let missing = parent.path().join("never-created");
        let propagator = SyncPropagator::new(&missing, fast_backoff());

        let err = propagator.propagate(&bundle()).await.unwrap_err();
        match err {
            PropagateError::TargetUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.class(), ErrorClass::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_target_is_picked_up() {
        let parent = TempDir::new().unwrap();
        let target = parent.path().join("late");
        let propagator = SyncPropagator::new(
            &target,
            BackoffPolicy::new(5, Duration::from_millis(50), Duration::from_secs(1)),
        );

        let dir = target.clone();
        let creator = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            fs::create_dir_all(&dir).unwrap();
        });

        propagator.propagate(&bundle()).await.unwrap();
        creator.await.unwrap();
        assert!(target.join(CHAIN_FILE).exists());
    }
}
