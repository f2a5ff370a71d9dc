//! Whole-document account stores
//!
//! An `AccountStore` hands out the full `PoolDocument` and accepts it back
//! whole; there is no partial-patch contract. Callers read, mutate in
//! memory, and write the result.
//!
//! `JsonFileStore` re-reads the file on every load, so writes from another
//! process are picked up (last writer wins). Writes use temp-file + rename
//! so a crash mid-write never leaves a torn document.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::document::PoolDocument;
use crate::error::{Error, Result};

/// Boxed future returned by store methods, for `Arc<dyn AccountStore>`.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Whole-value get/set over the pool document.
pub trait AccountStore: Send + Sync {
    /// Read the current document.
    fn load(&self) -> StoreFuture<'_, PoolDocument>;

    /// Replace the stored document.
    fn save<'a>(&'a self, document: &'a PoolDocument) -> StoreFuture<'a, ()>;
}

/// JSON file backed store.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist it is created holding an empty document, so
    /// the pool cold-starts with zero accounts.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let document = read_document(&path).await?;
            info!(
                path = %path.display(),
                accounts = document.accounts.len(),
                assignments = document.assignments.len(),
                "loaded account store"
            );
        } else {
            info!(path = %path.display(), "account store not found, starting empty");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Io(format!("creating store directory: {e}")))?;
            }
            write_atomic(&path, &PoolDocument::default()).await?;
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccountStore for JsonFileStore {
    fn load(&self) -> StoreFuture<'_, PoolDocument> {
        Box::pin(async move {
            if !self.path.exists() {
                return Ok(PoolDocument::default());
            }
            read_document(&self.path).await
        })
    }

    fn save<'a>(&'a self, document: &'a PoolDocument) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            write_atomic(&self.path, document).await
        })
    }
}

/// In-memory store for tests and ephemeral pools.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PoolDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing document.
    pub fn with_document(document: PoolDocument) -> Self {
        Self {
            state: Mutex::new(document),
        }
    }
}

impl AccountStore for MemoryStore {
    fn load(&self) -> StoreFuture<'_, PoolDocument> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn save<'a>(&'a self, document: &'a PoolDocument) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            *self.state.lock().await = document.clone();
            Ok(())
        })
    }
}

async fn read_document(path: &Path) -> Result<PoolDocument> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading account store: {e}")))?;
    if contents.trim().is_empty() {
        return Ok(PoolDocument::default());
    }
    serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing account store: {e}")))
}

/// Write the document to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The file holds account emails and config paths, so it is
/// restricted to 0600 on unix.
async fn write_atomic(path: &Path, document: &PoolDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| Error::Parse(format!("serializing account store: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("store path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted account store");
    Ok(())
}
