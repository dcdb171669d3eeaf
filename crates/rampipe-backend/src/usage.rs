//! Best-effort recursive size measurement for `status` reporting

use std::io;
use std::path::Path;

/// Sum the apparent sizes of `path` and everything beneath it
///
/// Symlinks are counted but never followed. Entries that vanish or become
/// unreadable mid-walk are skipped; status figures are best effort and a
/// concurrent mutation must not fail the whole walk.
pub fn tree_size(path: &Path) -> io::Result<u64> {
    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
