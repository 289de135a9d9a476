//! Size and modification time of a remote object or a cached copy.

use super::remote_ref::RemoteRef;
use chrono::{DateTime, TimeZone, Utc};
use filetime::FileTime;
use std::time::Duration;

/// Object metadata key carrying the producer's mtime, in float seconds.
pub const MTIME_METADATA_KEY: &str = "mtime";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    /// Size in bytes.
    pub size: u64,

    /// Modification time. For remote objects this is the mirrored `mtime`
    /// metadata when present, otherwise the store's last-modified time.
    pub mtime: DateTime<Utc>,
}

impl ObjectStat {
    pub fn new(size: u64, mtime: DateTime<Utc>) -> Self {
        Self { size, mtime }
    }

    /// Whether a cached copy described by `self` must be re-downloaded to
    /// match `remote`: sizes differ, or remote is newer by more than `tolerance`.
    pub fn is_stale_against(&self, remote: &ObjectStat, tolerance: Duration) -> bool {
        if self.size != remote.size {
            return true;
        }
        let limit = chrono::Duration::from_std(tolerance)
            .ok()
            .and_then(|tolerance| self.mtime.checked_add_signed(tolerance));
        match limit {
            Some(limit) => remote.mtime > limit,
            None => false,
        }
    }
}

/// One object found under a listed prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub reference: RemoteRef,
    pub stat: ObjectStat,
}

/// Parse the float-seconds form stored in object metadata. Plain decimals
/// are read digit by digit so no precision is lost to `f64`.
pub fn mtime_from_metadata(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Some(exact) = parse_decimal_seconds(value) {
        return Some(exact);
    }
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos).single()
}

fn parse_decimal_seconds(value: &str) -> Option<DateTime<Utc>> {
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if whole.is_empty() || !digits_only(whole) || !digits_only(fraction) {
        return None;
    }
    let seconds: i64 = whole.parse().ok()?;
    let mut nanos: String = fraction.chars().take(9).collect();
    while nanos.len() < 9 {
        nanos.push('0');
    }
    Utc.timestamp_opt(seconds, nanos.parse().ok()?).single()
}

/// Float-seconds form written into object metadata on upload, truncated to
/// microseconds so it never reads back later than the file it came from.
pub fn mtime_to_metadata(mtime: DateTime<Utc>) -> String {
    if mtime.timestamp() < 0 {
        let seconds = mtime.timestamp() as f64 + f64::from(mtime.timestamp_subsec_nanos()) / 1e9;
        return format!("{seconds}");
    }
    format!("{}.{:06}", mtime.timestamp(), mtime.timestamp_subsec_micros())
}

pub fn file_time_to_utc(time: FileTime) -> DateTime<Utc> {
    Utc.timestamp_opt(time.unix_seconds(), time.nanoseconds())
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn utc_to_file_time(time: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos())
}
