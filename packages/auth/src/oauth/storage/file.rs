// ABOUTME: JSON file token store with atomic replace and an exclusive lock on <path>.lock
// ABOUTME: Writers stage to <path>.tmp and rename; readers only ever open the canonical path

use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fs2::FileExt;
use sonata_config::constants::SONATA_USERNAME;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::TokenStore;
use crate::{
    error::{AuthError, AuthResult},
    oauth::types::TokenInfo,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Replace characters that are illegal in file names with `_`
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl FileTokenStore {
    /// Store at an explicit path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// `<base_dir>/.cache` or `<base_dir>/.cache-<username>`; the username
    /// falls back to `SONATA_USERNAME`
    pub fn for_user(base_dir: impl AsRef<Path>, username: Option<&str>) -> Self {
        let file_name = match sonata_config::env_fallback(username, SONATA_USERNAME) {
            Some(user) => format!(".cache-{}", sanitize_username(&user)),
            None => ".cache".to_string(),
        };
        Self::with_path(base_dir.as_ref().join(file_name))
    }

    /// Per-user cache under the platform cache directory
    pub fn default_location(username: Option<&str>) -> AuthResult<Self> {
        let base = dirs::cache_dir()
            .ok_or_else(|| {
                AuthError::Configuration("Could not determine cache directory".to_string())
            })?
            .join("sonata");
        Ok(Self::for_user(base, username))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    pub fn tmp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    /// Take the exclusive lock on `<path>.lock`.
    ///
    /// The lock lives on the open file, so a writer that dies releases it
    /// with its process. A lock file left on disk by such a writer is simply
    /// locked again. The holder unlinks the file on release, so after locking
    /// we check that the path still names the file we hold; otherwise a later
    /// writer could lock a fresh file at the same path at the same time.
    async fn acquire_lock(&self) -> AuthResult<LockGuard> {
        let lock_path = self.lock_path();
        let started = Instant::now();

        loop {
            let file = open_lock_file(&lock_path)?;
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    if holds_current_lock(&file, &lock_path)? {
                        return Ok(LockGuard {
                            path: lock_path,
                            _file: file,
                        });
                    }
                    debug!("Cache lock {} was replaced, retrying", lock_path.display());
                }
                Err(e) if is_contended(&e) => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(AuthError::LockTimeout(lock_path));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No token cache at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            AuthError::Storage(format!(
                "Corrupt token cache {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn save_token_to_cache(&self, token: &TokenInfo) -> AuthResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let payload = serde_json::to_vec_pretty(token)?;
        let _lock = self.acquire_lock().await?;

        // Only the lock holder touches the staging file; a crashed writer may
        // have left one behind with other permissions
        let tmp_path = self.tmp_path();
        remove_if_exists(&tmp_path).await?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;
        debug!("Saved token cache to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> AuthResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !fs::try_exists(parent).await? {
                return Ok(());
            }
        }
        let _lock = self.acquire_lock().await?;
        remove_if_exists(&self.path).await
    }
}

/// Unlinks the lock file while still holding the lock, then releases it
/// when the handle closes. Runs on error paths too.
struct LockGuard {
    path: PathBuf,
    _file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Fields drop after this body, so the unlink happens under the lock
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove cache lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(lock_path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether `lock_path` still names the file behind `file`
#[cfg(unix)]
fn holds_current_lock(file: &File, lock_path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(lock_path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// An open file cannot be unlinked here, so the path always names the held file
#[cfg(not(unix))]
fn holds_current_lock(_file: &File, _lock_path: &Path) -> io::Result<bool> {
    Ok(true)
}

async fn remove_if_exists(path: &Path) -> AuthResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
