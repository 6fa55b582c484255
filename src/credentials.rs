use crate::error::{AppdownError, Result};
use crate::session::Identity;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persistence for the single active account record.
///
/// Implementations serialize their own writes; callers never touch the
/// stored record directly.
pub trait CredentialStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<Identity>>;

    fn save(&self, identity: &Identity) -> Result<()>;

    /// Returns whether a record was removed.
    fn delete(&self) -> Result<bool>;
}

/// JSON record on disk, readable only by the owner.
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Identity>> {
        let _guard = self.lock.lock();
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let identity = serde_json::from_str(&text).map_err(|e| {
            AppdownError::CredentialStore(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(identity))
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        let _guard = self.lock.lock();
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.write_all(&serde_json::to_vec_pretty(identity)?)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| AppdownError::CredentialStore(e.error.to_string()))?;
        tracing::debug!(path = %self.path.display(), "saved account record");
        Ok(())
    }

    fn delete(&self) -> Result<bool> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, for embedding and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<Identity>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Identity>> {
        Ok(self.record.lock().clone())
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        *self.record.lock() = Some(identity.clone());
        Ok(())
    }

    fn delete(&self) -> Result<bool> {
        Ok(self.record.lock().take().is_some())
    }
}
