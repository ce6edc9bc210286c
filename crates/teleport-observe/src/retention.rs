use std::path::Path;

use time::{Date, Duration, OffsetDateTime, macros::format_description};
use tracing::{debug, warn};

/// Delete rotated files (`<prefix>.YYYY-MM-DD`) older than `retention_days`.
/// Returns how many files were removed. Files without a parseable date
/// suffix, including the current unrotated file, are left alone.
pub fn prune_rotated_files(dir: &Path, prefix: &str, retention_days: u32) -> std::io::Result<usize> {
    if retention_days == 0 || !dir.is_dir() {
        return Ok(0);
    }

    let format = format_description!("[year]-[month]-[day]");
    let cutoff = OffsetDateTime::now_utc().date() - Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        let Ok(date) = Date::parse(suffix, &format) else {
            continue;
        };
        if date < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(file = name, "pruned rotated file");
                    removed += 1;
                }
                Err(e) => warn!(file = name, "failed to prune rotated file: {e}"),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_only_dated_files_past_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("app.log.2000-01-01");
        let current = dir.path().join("app.log");
        let unrelated = dir.path().join("other.txt");
        std::fs::write(&old, "x").unwrap();
        std::fs::write(&current, "x").unwrap();
        std::fs::write(&unrelated, "x").unwrap();

        let removed = prune_rotated_files(dir.path(), "app.log", 7).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(current.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn zero_retention_disables_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("app.log.2000-01-01");
        std::fs::write(&old, "x").unwrap();
        assert_eq!(prune_rotated_files(dir.path(), "app.log", 0).unwrap(), 0);
        assert!(old.exists());
    }
}
