//! Console log tailing and rotation (spec §4.F.1 `streamInstanceLogs`, §4.F.9
//! `rotateLogs`).

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use vmkit_core::error::Result;
use vmkit_core::paths::Paths;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The last `tail` lines of a console log. A missing file reads as empty —
/// a freshly-created instance has no console output yet, that's not an
/// error.
pub async fn tail_lines(path: &Path, tail: usize) -> Result<Vec<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines[start..].to_vec())
}

/// Emit the last `tail` lines, then, if `follow` is set, keep polling for
/// appended bytes until the receiver is dropped (spec: "continues until the
/// reader cancels").
pub async fn stream_lines(path: &Path, tail: usize, follow: bool, tx: mpsc::Sender<String>) -> Result<()> {
    for line in tail_lines(path, tail).await? {
        if tx.send(line).await.is_err() {
            return Ok(());
        }
    }
    if !follow {
        return Ok(());
    }

    let mut offset = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        let Ok(metadata) = tokio::fs::metadata(path).await else { continue };
        if metadata.len() <= offset {
            continue;
        }
        let Ok(mut file) = tokio::fs::File::open(path).await else { continue };
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).await.is_err() {
            continue;
        }
        offset = metadata.len();
        for line in String::from_utf8_lossy(&buf).lines() {
            if tx.send(line.to_string()).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Rotate one instance's console log if it exceeds `max_bytes`: shift
/// `console.log.N` to `console.log.N+1` up to `max_files`, drop the oldest,
/// then truncate (never unlink) `console.log` so the hypervisor's open file
/// handle keeps appending.
pub async fn rotate_one(paths: &Paths, instance_id: &str, max_bytes: u64, max_files: u32) -> Result<()> {
    let current = paths.guest_console_log(instance_id);
    let metadata = match tokio::fs::metadata(&current).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if metadata.len() <= max_bytes {
        return Ok(());
    }

    let oldest = paths.guest_console_log_rotated(instance_id, max_files);
    let _ = tokio::fs::remove_file(&oldest).await;
    for index in (1..max_files).rev() {
        let from = paths.guest_console_log_rotated(instance_id, index);
        let to = paths.guest_console_log_rotated(instance_id, index + 1);
        let _ = tokio::fs::rename(&from, &to).await;
    }
    tokio::fs::copy(&current, paths.guest_console_log_rotated(instance_id, 1)).await?;

    let file = tokio::fs::OpenOptions::new().write(true).truncate(true).open(&current).await?;
    file.set_len(0).await?;
    Ok(())
}

/// Rotate every instance under `guests/`, continuing past per-instance
/// errors and returning the last one seen; never fatal to the caller loop
/// (spec §4.F.9).
pub async fn rotate_all(paths: &Paths, max_bytes: u64, max_files: u32) -> Result<()> {
    let guests_dir = paths.root().join("guests");
    let mut entries = match tokio::fs::read_dir(&guests_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut last_err = None;
    while let Some(entry) = entries.next_entry().await? {
        let Some(instance_id) = entry.file_name().into_string().ok() else { continue };
        if let Err(e) = rotate_one(paths, &instance_id, max_bytes, max_files).await {
            last_err = Some(e);
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_lines_returns_only_the_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        tokio::fs::write(&path, "a\nb\nc\nd\n").await.unwrap();
        let lines = tail_lines(&path, 2).await.unwrap();
        assert_eq!(lines, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn tail_lines_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-log");
        assert!(tail_lines(&path, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_lines_without_follow_closes_after_initial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        tokio::fs::write(&path, "x\ny\n").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        stream_lines(&path, 10, false, tx).await.unwrap();
        let mut received = vec![];
        while let Some(line) = rx.recv().await {
            received.push(line);
        }
        assert_eq!(received, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn rotate_one_skips_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let instance_id = "abc";
        let log = paths.guest_console_log(instance_id);
        tokio::fs::create_dir_all(log.parent().unwrap()).await.unwrap();
        tokio::fs::write(&log, b"small").await.unwrap();
        rotate_one(&paths, instance_id, 1024, 3).await.unwrap();
        assert_eq!(tokio::fs::read(&log).await.unwrap(), b"small");
    }

    #[tokio::test]
    async fn rotate_one_truncates_and_preserves_history() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let instance_id = "abc";
        let log = paths.guest_console_log(instance_id);
        tokio::fs::create_dir_all(log.parent().unwrap()).await.unwrap();
        tokio::fs::write(&log, vec![b'x'; 100]).await.unwrap();

        rotate_one(&paths, instance_id, 10, 2).await.unwrap();

        assert_eq!(tokio::fs::metadata(&log).await.unwrap().len(), 0);
        let rotated = paths.guest_console_log_rotated(instance_id, 1);
        assert_eq!(tokio::fs::metadata(&rotated).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn rotate_one_drops_oldest_past_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let instance_id = "abc";
        let log = paths.guest_console_log(instance_id);
        tokio::fs::create_dir_all(log.parent().unwrap()).await.unwrap();

        for _ in 0..3 {
            tokio::fs::write(&log, vec![b'x'; 100]).await.unwrap();
            rotate_one(&paths, instance_id, 10, 2).await.unwrap();
        }

        let rotated_2 = paths.guest_console_log_rotated(instance_id, 2);
        assert!(tokio::fs::metadata(&rotated_2).await.is_ok());
    }

    #[tokio::test]
    async fn rotate_all_is_a_noop_with_no_guests_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        rotate_all(&paths, 1024, 3).await.unwrap();
    }
}
