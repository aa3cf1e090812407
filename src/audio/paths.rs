//! Locations of diagnostic recordings and their retention.
//!
//! Default directory: ~/.local/share/talkback/recordings/

use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default recordings directory.
pub fn default_recordings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("talkback")
        .join("recordings")
}

/// Generate a unique WAV path inside `dir`, creating the directory.
/// Format: ptt_<YYYYMMDD_HHMMSS>_<uuid>.wav
pub fn generate_wav_path(dir: &Path, recording_id: Uuid) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    Ok(dir.join(format!("ptt_{}_{}.wav", timestamp, recording_id)))
}

/// Keep only the newest `keep` WAV files in `dir`. Returns how many were deleted.
pub fn cleanup_old_recordings(dir: &Path, keep: usize) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "wav")
                .unwrap_or(false)
        })
        .collect();

    if entries.len() <= keep {
        return Ok(0);
    }

    // Oldest first
    entries.sort_by(|a, b| {
        let time_a = a.metadata().and_then(|m| m.modified()).ok();
        let time_b = b.metadata().and_then(|m| m.modified()).ok();
        time_a.cmp(&time_b).then_with(|| a.file_name().cmp(&b.file_name()))
    });

    let to_delete = entries.len() - keep;
    let mut deleted = 0;

    for entry in entries.into_iter().take(to_delete) {
        if fs::remove_file(entry.path()).is_ok() {
            log::debug!("Cleaned up old recording: {:?}", entry.path());
            deleted += 1;
        }
    }

    Ok(deleted)
}
