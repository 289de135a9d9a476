//! Localization cache: maps `gs://bucket/key` to `<root>/bucket/key`,
//! keeps the local copy fresh, and pushes produced outputs back.
//!
//! Freshness: an existing copy is re-downloaded when its size differs from
//! the remote object or the remote mtime is newer than the copy's mtime
//! (beyond the configured tolerance). Downloads stamp the copy with the
//! remote mtime, so an untouched object stays fresh forever.
//!
//! Check-decide-download for one key runs under a per-key lock, so
//! concurrent callers for the same object share a single transfer.

use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::remote_ref::RemoteRef,
    services::{
        accessor::ObjectAccessor,
        keyed_lock::KeyedLocks,
        local_fs,
        proxy::PathProxy,
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{
    collections::HashSet,
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

/// Concurrent object transfers while localizing or uploading a directory.
const DIR_TRANSFER_CONCURRENCY: usize = 8;

pub struct LocalizationCache {
    root: PathBuf,
    accessor: Arc<dyn ObjectAccessor>,
    locks: KeyedLocks,
    mtime_tolerance: Duration,
}

impl LocalizationCache {
    /// Create the cache root if needed and verify it is writable.
    pub async fn new(
        root: impl Into<PathBuf>,
        accessor: Arc<dyn ObjectAccessor>,
        mtime_tolerance: Duration,
    ) -> LocalizeResult<Self> {
        let root = root.into();
        ensure_cache_root(&root).await?;
        info!("localizing gs:// objects under {}", root.display());
        Ok(Self {
            root,
            accessor,
            locks: KeyedLocks::new(),
            mtime_tolerance,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accessor(&self) -> &Arc<dyn ObjectAccessor> {
        &self.accessor
    }

    /// Deterministic cache location for `reference`.
    pub fn local_path(&self, reference: &RemoteRef) -> PathBuf {
        reference.local_path(&self.root)
    }

    /// Inverse of `local_path` for paths inside the cache root.
    pub fn remote_for(&self, local: &Path) -> Option<RemoteRef> {
        let relative = local.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        let (bucket, key) = parts.split_first()?;
        RemoteRef::new(bucket, &key.join("/")).ok()
    }

    /// Ensure a fresh local copy of one object and return its path.
    pub async fn localize(&self, reference: &RemoteRef) -> LocalizeResult<PathBuf> {
        if reference.is_bucket() || reference.is_prefix() {
            return Err(LocalizeError::InvalidReference {
                uri: reference.to_string(),
                reason: "expected an object, got a prefix".into(),
            });
        }

        let local = self.local_path(reference);
        let _guard = self.locks.lock(&reference.cache_key()).await;

        match local_fs::metadata(&local).await? {
            None => {
                info!("localizing {} ...", reference);
                self.accessor.download(reference, &local).await?;
            }
            Some(meta) if meta.is_dir() => {
                return Err(LocalizeError::io(
                    &local,
                    io::Error::other("cache path is occupied by a directory"),
                ));
            }
            Some(meta) => {
                let cached = local_fs::stat_of(&meta);
                let remote = self.accessor.stat(reference).await?;
                if cached.is_stale_against(&remote, self.mtime_tolerance) {
                    info!(
                        "re-localizing {}: cached size={} mtime={}, remote size={} mtime={}",
                        reference, cached.size, cached.mtime, remote.size, remote.mtime
                    );
                    self.accessor.download(reference, &local).await?;
                } else {
                    debug!("cache hit for {} at {}", reference, local.display());
                }
            }
        }

        Ok(local)
    }

    /// Localize every object below a prefix; returns the local directory.
    /// An empty prefix does not exist and is `NotFound`.
    pub async fn localize_dir(&self, reference: &RemoteRef) -> LocalizeResult<PathBuf> {
        let prefix = reference.as_prefix();
        if prefix.is_bucket() {
            return Err(LocalizeError::InvalidReference {
                uri: reference.to_string(),
                reason: "cannot localize a whole bucket".into(),
            });
        }

        let entries = self.accessor.list(&prefix).await?;
        if entries.is_empty() {
            return Err(LocalizeError::NotFound {
                uri: prefix.to_string(),
            });
        }

        let local_dir = self.local_path(&prefix);
        fs::create_dir_all(&local_dir)
            .await
            .map_err(|err| LocalizeError::io(&local_dir, err))?;

        // every ancestor directory of a listed key
        let parents: HashSet<String> = entries
            .iter()
            .flat_map(|entry| {
                let key = entry.reference.key();
                key.match_indices('/')
                    .map(|(at, _)| key[..at].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();

        let parents = &parents;

        info!("localizing {} ({} objects) ...", prefix, entries.len());
        stream::iter(entries)
            .map(|entry| async move {
                let key = entry.reference.key().trim_end_matches('/');
                if entry.reference.is_prefix() || parents.contains(key) {
                    // directory marker object
                    let dir = self.local_path(&entry.reference);
                    fs::create_dir_all(&dir)
                        .await
                        .map_err(|err| LocalizeError::io(&dir, err))
                } else {
                    self.localize(&entry.reference).await.map(|_| ())
                }
            })
            .buffer_unordered(DIR_TRANSFER_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        Ok(local_dir)
    }

    /// Working location for a declared remote output. Files get their
    /// parent created, directories are created themselves.
    pub async fn prepare_output(
        &self,
        reference: &RemoteRef,
        is_dir: bool,
    ) -> LocalizeResult<PathBuf> {
        let local = self.local_path(reference);
        let dir = if is_dir {
            local.clone()
        } else {
            match local.parent() {
                Some(parent) => parent.to_path_buf(),
                None => return Ok(local),
            }
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| LocalizeError::io(&dir, err))?;
        Ok(local)
    }

    /// Upload a unit's local output to its declared remote target.
    ///
    /// - `Localized { local, remote }`: `local` goes to `remote`.
    /// - `Local(path)` inside the cache root: goes to the reference it maps to.
    /// - anything else has no remote target and is left alone.
    ///
    /// Returns the reference written to, if any.
    pub async fn delocalize(&self, output: &PathProxy) -> LocalizeResult<Option<RemoteRef>> {
        let (local, target) = match output {
            PathProxy::Localized { local, remote } => (local.clone(), remote.clone()),
            PathProxy::Local(path) => match self.remote_for(path) {
                Some(remote) => (path.clone(), remote),
                None => return Ok(None),
            },
            PathProxy::Remote(_) => return Ok(None),
        };

        push(self.accessor.as_ref(), &local, &target).await?;
        Ok(Some(target))
    }
}

/// Upload `local` to `target`: a single object for a file, every regular
/// file below it (under `target` as a prefix) for a directory.
pub async fn push(
    accessor: &dyn ObjectAccessor,
    local: &Path,
    target: &RemoteRef,
) -> LocalizeResult<()> {
    match local_fs::metadata(local).await? {
        Some(meta) if meta.is_dir() => push_dir(accessor, local, &target.as_prefix()).await,
        _ => accessor.upload(local, target).await,
    }
}

async fn push_dir(
    accessor: &dyn ObjectAccessor,
    local: &Path,
    prefix: &RemoteRef,
) -> LocalizeResult<()> {
    let files: Vec<_> = local_fs::walk(local)
        .await?
        .into_iter()
        .filter(|entry| !entry.is_dir)
        .collect();
    info!("uploading {} files from {} to {}", files.len(), local.display(), prefix);

    stream::iter(files)
        .map(|entry| async move {
            let target = prefix.child(&entry.relative)?;
            accessor.upload(&entry.path, &target).await
        })
        .buffer_unordered(DIR_TRANSFER_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

/// Create the cache root (idempotent) and probe it with a scratch file.
async fn ensure_cache_root(root: &Path) -> LocalizeResult<()> {
    if RemoteRef::is_remote(&root.to_string_lossy()) {
        return Err(LocalizeError::Configuration(format!(
            "cache root must be a local directory, got {}",
            root.display()
        )));
    }

    fs::create_dir_all(root).await.map_err(|err| {
        LocalizeError::Configuration(format!(
            "cannot create cache root {}: {err}",
            root.display()
        ))
    })?;

    let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
    let written = fs::write(&probe, b"probe").await;
    let read_back = match written {
        Ok(()) => fs::read(&probe).await,
        Err(err) => {
            return Err(LocalizeError::Configuration(format!(
                "cache root {} is not writable: {err}",
                root.display()
            )));
        }
    };
    let _ = fs::remove_file(&probe).await;

    match read_back {
        Ok(bytes) if bytes == b"probe" => Ok(()),
        Ok(_) => Err(LocalizeError::Configuration(format!(
            "cache root {} returned mismatched content",
            root.display()
        ))),
        Err(err) => Err(LocalizeError::Configuration(format!(
            "cache root {} is not readable: {err}",
            root.display()
        ))),
    }
}
