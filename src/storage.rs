use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::{Db, DbBuilder, Error as SlateError};
use thiserror::Error;

use crate::settings::{Backend, DatabaseConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] SlateError),
    #[error("queue root {path}: {source}")]
    Root {
        path: String,
        source: std::io::Error,
    },
    #[error("object store for {path}: {message}")]
    ObjectStore { path: String, message: String },
}

/// Where a queue database lives.
pub struct QueueStore {
    pub store: Arc<dyn ObjectStore>,
    /// Filesystem roots are canonicalized; other backends keep the configured path.
    pub root: String,
}

impl QueueStore {
    pub fn resolve(backend: &Backend, path: &str) -> Result<Self, StorageError> {
        match backend {
            Backend::Fs => Self::local(path),
            Backend::Memory => Ok(Self {
                store: Arc::new(InMemory::new()),
                root: path.to_string(),
            }),
            // s3://bucket/prefix and friends go through SlateDB's resolver
            Backend::S3 | Backend::Url => Ok(Self {
                store: Db::resolve_object_store(path)?,
                root: path.to_string(),
            }),
        }
    }

    fn local(path: &str) -> Result<Self, StorageError> {
        let root_err = |source| StorageError::Root {
            path: path.to_string(),
            source,
        };
        std::fs::create_dir_all(path).map_err(root_err)?;
        // LocalFileSystem percent-encodes relative prefixes like "./q" inconsistently
        let root = Path::new(path)
            .canonicalize()
            .map_err(root_err)?
            .to_string_lossy()
            .into_owned();
        let store = LocalFileSystem::new_with_prefix(&root).map_err(|e| StorageError::ObjectStore {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            store: Arc::new(store),
            root,
        })
    }
}

/// Open the SlateDB instance backing one queue shard.
pub async fn open_queue_db(cfg: &DatabaseConfig) -> Result<(Arc<Db>, String), StorageError> {
    let QueueStore { store, root } = QueueStore::resolve(&cfg.backend, &cfg.path)?;
    let mut builder = DbBuilder::new(root.as_str(), store);
    if let Some(flush_ms) = cfg.flush_interval_ms {
        builder = builder.with_settings(slatedb::config::Settings {
            flush_interval: Some(Duration::from_millis(flush_ms)),
            ..Default::default()
        });
    }
    let db = builder.build().await?;
    Ok((Arc::new(db), root))
}
