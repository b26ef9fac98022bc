use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

/// Error type returned by [`KeyValueStore`] implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Durable, synchronous, string-keyed storage that survives restarts.
///
/// The [`SessionManager`](crate::SessionManager) is the only reader and writer
/// of the session keys; other keys in the same store are left alone.
///
/// # Example
///
/// ```rust,ignore
/// impl KeyValueStore for MyPrefs {
///     fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
///         Ok(self.db.read(key)?)
///     }
///
///     fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
///         self.db.write(key, value)?;
///         Ok(())
///     }
///
///     fn remove(&self, key: &str) -> Result<(), StoreError> {
///         self.db.delete(key)?;
///         Ok(())
///     }
/// }
/// ```
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// The four persisted session keys under one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    access_token: String,
    refresh_token: String,
    user: String,
    token_expiry: String,
}

impl SessionKeys {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            access_token: format!("{namespace}access_token"),
            refresh_token: format!("{namespace}refresh_token"),
            user: format!("{namespace}user"),
            token_expiry: format!("{namespace}token_expiry"),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn token_expiry(&self) -> &str {
        &self.token_expiry
    }

    #[must_use]
    pub fn all(&self) -> [&str; 4] {
        [
            &self.access_token,
            &self.refresh_token,
            &self.user,
            &self.token_expiry,
        ]
    }
}

impl Default for SessionKeys {
    fn default() -> Self {
        Self::new("")
    }
}

/// In-process store. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| "memory store lock poisoned")?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| "memory store lock poisoned")?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| "memory store lock poisoned")?;
        entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Every write rewrites the file through a uniquely named temporary file in
/// the same directory and an atomic rename, so a crash never leaves a
/// half-written file behind. Writes are synchronous; the file is a few hundred
/// bytes.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating it lazily on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a
    /// JSON object of strings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => HashMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(entries)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| "file store lock poisoned")?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| "file store lock poisoned")?;
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| "file store lock poisoned")?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}
