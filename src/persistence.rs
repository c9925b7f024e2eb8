//! Shared atomic-write helpers for persisted state (`TelemetryStore`,
//! `EvolutionEngine`): every on-disk write in this crate goes
//! temp-file-then-rename so readers never observe a partial file.

use std::io;
use std::path::Path;

use serde::Serialize;

/// Serializes `value` as pretty JSON and writes it to `path` atomically: a
/// sibling `.tmp` file is written and fsynced, then renamed over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_bytes_atomic(path, &json)
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(tmp_extension(path));
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        std::io::Write::write_all(&mut file, bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

/// Copies `path` to a timestamped sibling under `backups/` before the
/// caller overwrites it. A missing source file is not an error: there is
/// nothing to back up yet.
pub fn backup_before_overwrite(path: &Path, unix_timestamp: u64) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let backups_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("backups");
    std::fs::create_dir_all(&backups_dir)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("state");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let backup_path = backups_dir.join(format!("{stem}_{unix_timestamp}.{ext}"));
    std::fs::copy(path, backup_path)?;
    Ok(())
}

fn tmp_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}
