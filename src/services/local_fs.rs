//! Filesystem queries for cached copies and unit-produced outputs.

use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::stat::{ObjectStat, file_time_to_utc},
    services::atomic::is_temp_name,
};
use filetime::FileTime;
use std::{
    fs::Metadata,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;

/// One entry found below a walked directory.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// `/`-joined path relative to the walk root.
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub stat: ObjectStat,
}

pub fn stat_of(meta: &Metadata) -> ObjectStat {
    ObjectStat::new(
        meta.len(),
        file_time_to_utc(FileTime::from_last_modification_time(meta)),
    )
}

/// Metadata of `path`, `None` when it does not exist.
pub async fn metadata(path: &Path) -> LocalizeResult<Option<Metadata>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LocalizeError::io(path, err)),
    }
}

/// Every file and directory below `root`, depth first. Symlinks to files
/// are followed; symlinks to directories are skipped, and so are downloads
/// still being written.
pub async fn walk(root: &Path) -> LocalizeResult<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|err| LocalizeError::io(&dir, err))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| LocalizeError::io(&dir, err))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if is_temp_name(&file_name) {
                continue;
            }
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| LocalizeError::io(&path, err))?;
            let Some(meta) = metadata(&path).await? else {
                // dangling symlink
                continue;
            };
            if file_type.is_symlink() && meta.is_dir() {
                continue;
            }

            let relative = format!("{prefix}{file_name}");
            if meta.is_dir() {
                pending.push((path.clone(), format!("{relative}/")));
            }
            entries.push(LocalEntry {
                relative,
                is_dir: meta.is_dir(),
                stat: stat_of(&meta),
                path,
            });
        }
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

/// Remove a file or a directory tree; missing paths are fine.
pub async fn remove_path(path: &Path) -> LocalizeResult<()> {
    let Some(meta) = metadata(path).await? else {
        return Ok(());
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LocalizeError::io(path, err)),
    }
}

/// Number of `/` separators in a relative path, trailing slash ignored.
pub fn depth_of(relative: &str) -> usize {
    relative.trim_end_matches('/').matches('/').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn walk_lists_nested_entries_relative_to_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"12345").unwrap();
        std::fs::write(tmp.path().join("a/b/deep.txt"), b"x").unwrap();

        let entries = walk(tmp.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(names, vec!["a", "a/b", "a/b/deep.txt", "top.txt"]);

        let top = entries.iter().find(|e| e.relative == "top.txt").unwrap();
        assert!(!top.is_dir);
        assert_eq!(top.stat.size, 5);
    }

    #[tokio::test]
    async fn walk_skips_downloads_in_flight() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/done.txt"), b"abc").unwrap();
        std::fs::write(
            tmp.path().join("sub/.part.bin.tmp-4b1f6c1e-8a63-4f4e-9d0c-1b8f0a2a9e11"),
            b"partial",
        )
        .unwrap();

        let entries = walk(tmp.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(names, vec!["sub", "sub/done.txt"]);
    }

    #[tokio::test]
    async fn metadata_of_missing_path_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(metadata(&tmp.path().join("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_path_handles_files_dirs_and_missing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        std::fs::create_dir_all(dir.join("x")).unwrap();
        std::fs::write(dir.join("x/f"), b"1").unwrap();

        remove_path(&dir).await.unwrap();
        assert!(!dir.exists());
        remove_path(&dir).await.unwrap();
    }

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth_of("test9.txt"), 0);
        assert_eq!(depth_of("test2/"), 0);
        assert_eq!(depth_of("test2/test1.txt"), 1);
    }
}
