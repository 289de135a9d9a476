//! Path-like value handed to the framework in place of a plain path.
//!
//! Metadata queries go to whichever store holds the authoritative copy: the
//! local filesystem for plain paths and for localized references whose
//! copy exists, the object store otherwise. The framework's own "is this
//! output already there and newer than its inputs" checks therefore give
//! the same answers with or without localization.

use crate::{
    errors::LocalizeResult,
    models::{
        remote_ref::RemoteRef,
        stat::{ObjectEntry, ObjectStat},
    },
    services::{accessor::ObjectAccessor, local_fs},
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Directory mtime looks this many levels deep unless told otherwise.
pub const DEFAULT_DIR_DEPTH: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathProxy {
    Local(PathBuf),
    /// Cloud object or prefix with no local materialization.
    Remote(RemoteRef),
    /// Local working copy paired with its cloud reference.
    Localized { local: PathBuf, remote: RemoteRef },
}

/// Where a query is answered.
enum Backing<'a> {
    Local(&'a Path),
    Remote(&'a RemoteRef),
}

impl PathProxy {
    /// Classify a declared path. Directory references become prefixes.
    pub fn from_declared(value: &str, is_dir: bool) -> LocalizeResult<Self> {
        if RemoteRef::is_remote(value) {
            let reference = RemoteRef::parse(value)?;
            let reference = if is_dir && !reference.is_bucket() {
                reference.as_prefix()
            } else {
                reference
            };
            Ok(PathProxy::Remote(reference))
        } else {
            Ok(PathProxy::Local(PathBuf::from(value)))
        }
    }

    pub fn remote(&self) -> Option<&RemoteRef> {
        match self {
            PathProxy::Remote(remote) | PathProxy::Localized { remote, .. } => Some(remote),
            PathProxy::Local(_) => None,
        }
    }

    pub fn local(&self) -> Option<&Path> {
        match self {
            PathProxy::Local(local) | PathProxy::Localized { local, .. } => Some(local),
            PathProxy::Remote(_) => None,
        }
    }

    /// The string a unit's script sees: local path when there is one.
    pub fn rendered(&self) -> String {
        match self {
            PathProxy::Local(local) | PathProxy::Localized { local, .. } => {
                local.to_string_lossy().into_owned()
            }
            PathProxy::Remote(remote) => remote.to_string(),
        }
    }

    async fn backing(&self) -> LocalizeResult<Backing<'_>> {
        Ok(match self {
            PathProxy::Local(local) => Backing::Local(local),
            PathProxy::Remote(remote) => Backing::Remote(remote),
            PathProxy::Localized { local, remote } => {
                if local_fs::metadata(local).await?.is_some() {
                    Backing::Local(local)
                } else {
                    Backing::Remote(remote)
                }
            }
        })
    }

    pub async fn exists(&self, accessor: &dyn ObjectAccessor) -> LocalizeResult<bool> {
        match self.backing().await? {
            Backing::Local(path) => Ok(local_fs::metadata(path).await?.is_some()),
            Backing::Remote(remote) if remote.is_bucket() => Ok(true),
            Backing::Remote(remote) if remote.is_prefix() => {
                accessor.has_objects_below(remote).await
            }
            Backing::Remote(remote) => accessor.exists(remote).await,
        }
    }

    /// File size, or the total size of everything below a directory.
    pub async fn size(&self, accessor: &dyn ObjectAccessor) -> LocalizeResult<u64> {
        match self.backing().await? {
            Backing::Local(path) => match local_fs::metadata(path).await? {
                Some(meta) if meta.is_dir() => Ok(local_fs::walk(path)
                    .await?
                    .iter()
                    .filter(|e| !e.is_dir)
                    .map(|e| e.stat.size)
                    .sum()),
                Some(meta) => Ok(meta.len()),
                None => Err(missing(path)),
            },
            Backing::Remote(remote) if remote.is_prefix() || remote.is_bucket() => {
                Ok(accessor.list(remote).await?.iter().map(|e| e.stat.size).sum())
            }
            Backing::Remote(remote) => Ok(accessor.stat(remote).await?.size),
        }
    }

    pub async fn mtime(&self, accessor: &dyn ObjectAccessor) -> LocalizeResult<DateTime<Utc>> {
        self.mtime_with_depth(accessor, DEFAULT_DIR_DEPTH).await
    }

    /// Modification time. For a file, its own. For a directory, the newest
    /// entry whose relative path has fewer than `depth` separators; depth 0
    /// is the directory's own mtime. Remote prefixes have no mtime of their
    /// own, so they are read at depth 1 or more and an empty prefix reports
    /// the epoch. An empty local directory reports its own mtime.
    pub async fn mtime_with_depth(
        &self,
        accessor: &dyn ObjectAccessor,
        depth: usize,
    ) -> LocalizeResult<DateTime<Utc>> {
        match self.backing().await? {
            Backing::Local(path) => {
                let meta = local_fs::metadata(path).await?.ok_or_else(|| missing(path))?;
                let own = local_fs::stat_of(&meta).mtime;
                if !meta.is_dir() || depth == 0 {
                    return Ok(own);
                }
                Ok(local_fs::walk(path)
                    .await?
                    .iter()
                    .filter(|e| local_fs::depth_of(&e.relative) < depth)
                    .map(|e| e.stat.mtime)
                    .max()
                    .unwrap_or(own))
            }
            Backing::Remote(remote) if remote.is_prefix() || remote.is_bucket() => {
                let prefix = remote.as_prefix();
                let depth = depth.max(1);
                let mut newest = DateTime::<Utc>::UNIX_EPOCH;
                for ObjectEntry { reference, stat: listed } in accessor.list(remote).await? {
                    let within = reference
                        .relative_to(&prefix)
                        .is_some_and(|rel| local_fs::depth_of(rel) < depth);
                    if !within {
                        continue;
                    }
                    // listings carry last-modified only; stat for the mirrored mtime
                    let mtime = match accessor.stat(&reference).await {
                        Ok(stat) => stat.mtime,
                        // directory markers list but do not stat
                        Err(err) if err.is_not_found() => listed.mtime,
                        Err(err) => return Err(err),
                    };
                    newest = newest.max(mtime);
                }
                Ok(newest)
            }
            Backing::Remote(remote) => Ok(accessor.stat(remote).await?.mtime),
        }
    }

    /// Size and mtime together, for freshness comparisons.
    pub async fn stat(&self, accessor: &dyn ObjectAccessor) -> LocalizeResult<ObjectStat> {
        Ok(ObjectStat::new(
            self.size(accessor).await?,
            self.mtime(accessor).await?,
        ))
    }

    /// Object stores have no real directories: any remote parent is
    /// writable. Local parents are checked on disk.
    pub async fn parent_exists(&self, _accessor: &dyn ObjectAccessor) -> LocalizeResult<bool> {
        match self.backing().await? {
            Backing::Local(path) => match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => {
                    Ok(local_fs::metadata(parent).await?.is_some_and(|m| m.is_dir()))
                }
                _ => Ok(true),
            },
            Backing::Remote(_) => Ok(true),
        }
    }

    /// Remove a declared output before a rerun: the local copy and the
    /// remote object (or every object under a prefix).
    pub async fn clear(&self, accessor: &dyn ObjectAccessor) -> LocalizeResult<()> {
        if let Some(local) = self.local() {
            local_fs::remove_path(local).await?;
        }
        if let Some(remote) = self.remote() {
            if remote.is_prefix() {
                for entry in accessor.list(remote).await?.iter().rev() {
                    accessor.delete(&entry.reference).await?;
                }
            } else if !remote.is_bucket() {
                accessor.delete(remote).await?;
            }
        }
        Ok(())
    }
}

fn missing(path: &Path) -> crate::errors::LocalizeError {
    crate::errors::LocalizeError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::NotFound, "path does not exist"),
    )
}
