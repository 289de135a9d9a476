//! Atomic materialization of downloaded content.
//!
//! Bytes go to `.{name}.tmp-{uuid}` next to the destination and are renamed
//! into place only after the whole stream was written, flushed, and synced.
//! A failed or cancelled write removes the temporary file, so the final path
//! is either absent, the previous copy, or the complete new copy.

use crate::{
    errors::{LocalizeError, LocalizeResult},
    models::stat::utc_to_file_time,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const TMP_MARKER: &str = ".tmp-";

/// Write `stream` to `destination` atomically and stamp it with `mtime`.
/// Returns the number of bytes written.
pub async fn write_atomically<S>(
    destination: &Path,
    stream: S,
    mtime: DateTime<Utc>,
) -> LocalizeResult<u64>
where
    S: Stream<Item = LocalizeResult<Bytes>>,
{
    let parent = destination.parent().ok_or_else(|| {
        LocalizeError::io(
            destination,
            io::Error::new(ErrorKind::InvalidInput, "destination has no parent directory"),
        )
    })?;
    let name = destination.file_name().ok_or_else(|| {
        LocalizeError::io(
            destination,
            io::Error::new(ErrorKind::InvalidInput, "destination has no file name"),
        )
    })?;

    // create_dir_all tolerates concurrent creators
    fs::create_dir_all(parent)
        .await
        .map_err(|err| LocalizeError::io(parent, err))?;

    let tmp_path = parent.join(format!(
        ".{}{TMP_MARKER}{}",
        name.to_string_lossy(),
        Uuid::new_v4()
    ));
    let mut guard = TempFileGuard::new(tmp_path.clone());

    let mut file = File::create(&tmp_path)
        .await
        .map_err(|err| LocalizeError::io(&tmp_path, err))?;

    let mut written: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|err| LocalizeError::io(&tmp_path, err))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| LocalizeError::io(&tmp_path, err))?;
    file.sync_all()
        .await
        .map_err(|err| LocalizeError::io(&tmp_path, err))?;
    drop(file);

    filetime::set_file_mtime(&tmp_path, utc_to_file_time(mtime))
        .map_err(|err| LocalizeError::io(&tmp_path, err))?;

    if let Err(err) = fs::rename(&tmp_path, destination).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(destination)
                .await
                .map_err(|err| LocalizeError::io(destination, err))?;
            fs::rename(&tmp_path, destination)
                .await
                .map_err(|err| LocalizeError::io(destination, err))?;
        } else {
            return Err(LocalizeError::io(destination, err));
        }
    }
    guard.disarm();

    debug!("materialized {} ({} bytes)", destination.display(), written);
    Ok(written)
}

/// True for names produced by `write_atomically` while a write is in flight.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TMP_MARKER)
}

/// Removes the temporary file on drop unless the rename went through.
/// Dropping the write future (cancellation) lands here too.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("removed partial download {}", self.path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!(
                    "failed to remove partial download {}: {}",
                    self.path.display(),
                    err
                ),
            }
        }
    }
}
