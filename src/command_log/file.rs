use super::{CommandLog, decode_record, encode_record};
use crate::core::{Command, CommandError, CommandId, CommandPayload, LogPosition, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::ffi::OsString;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::spawn_blocking;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{Level, event};

/// How often a waiting poll re-reads the file for records written by other processes.
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Complete records found on disk up to `byte_len`, which is always a line boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DiskExtent {
    byte_len: u64,
    records: u64,
}

struct FileShared {
    path: PathBuf,
    /// Advisory lock file held by every writer, in any process, around
    /// count-then-append.
    lock_path: PathBuf,
    /// Last extent this process saw; rescans start from here.
    extent: Mutex<DiskExtent>,
    appended: Notify,
}

#[derive(Debug, Clone, Copy, Default)]
struct FileCursor {
    byte_pos: u64,
    offset: u64,
}

/// Command log stored as JSON lines, one record per line.
///
/// The line index is the record's offset. Any number of processes may open
/// the same file: appends hold an exclusive lock on `<path>.lock`, count the
/// records on disk and write after the last one, so the returned offset is
/// the one every reader sees. Appends are synced to disk before they are
/// acknowledged. Clients opened through [`FileCommandLog::client`] also wake
/// each other's polls.
pub struct FileCommandLog {
    shared: Arc<FileShared>,
    cursor: Mutex<FileCursor>,
    position: AtomicU64,
    closed: AtomicBool,
}

impl FileCommandLog {
    /// Opens (or creates) the log at `path`.
    ///
    /// A trailing line without a newline is a torn write that was never
    /// acknowledged, so it is cut off.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(unavailable)?;
            }
        }
        let lock_path = lock_path_for(&path);

        let extent = {
            let path = path.clone();
            let lock_path = lock_path.clone();
            spawn_blocking(move || {
                with_write_lock(&lock_path, || {
                    let mut file = open_for_append(&path)?;
                    let (extent, torn) = scan_extent(&mut file, DiskExtent::default())?;
                    if torn > 0 {
                        event!(
                            Level::WARN,
                            path = %path.display(),
                            torn_bytes = torn,
                            "truncating torn command log tail"
                        );
                        file.set_len(extent.byte_len)?;
                        file.sync_all()?;
                    }
                    Ok(extent)
                })
            })
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?
        };

        Ok(Self::with_shared(Arc::new(FileShared {
            path,
            lock_path,
            extent: Mutex::new(extent),
            appended: Notify::new(),
        })))
    }

    fn with_shared(shared: Arc<FileShared>) -> Self {
        Self {
            shared,
            cursor: Mutex::new(FileCursor::default()),
            position: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Another client over the same file, with its own read cursor.
    pub fn client(&self) -> Self {
        Self::with_shared(self.shared.clone())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::LogUnavailable(format!(
                "command log client for {} is closed",
                self.shared.path.display()
            )));
        }
        Ok(())
    }

    async fn read_from(&self, cursor: &mut FileCursor) -> Result<Vec<Command>> {
        let mut file = match OpenOptions::new().read(true).open(&self.shared.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(err)),
        };
        file.seek(SeekFrom::Start(cursor.byte_pos))
            .await
            .map_err(unavailable)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(unavailable)?;

        let mut batch = Vec::new();
        let mut consumed = 0usize;
        // Only complete lines; a partial tail is picked up by a later poll.
        while let Some(rel_end) = buf[consumed..].iter().position(|b| *b == b'\n') {
            let line = &buf[consumed..consumed + rel_end];
            consumed += rel_end + 1;

            let text = std::str::from_utf8(line).map_err(|err| {
                CommandError::SerializationError(format!(
                    "command record at offset {} is not UTF-8: {}",
                    cursor.offset, err
                ))
            })?;
            if text.trim().is_empty() {
                continue;
            }
            batch.push(decode_record(text, cursor.offset)?);
            cursor.offset += 1;
        }
        cursor.byte_pos += consumed as u64;
        Ok(batch)
    }
}

fn unavailable(err: impl fmt::Display) -> CommandError {
    CommandError::LogUnavailable(err.to_string())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_for_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

/// Runs `f` while holding the exclusive writer lock; blocks until it is free.
fn with_write_lock<T>(
    lock_path: &Path,
    f: impl FnOnce() -> std::io::Result<T>,
) -> std::io::Result<T> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;
    FileExt::lock_exclusive(&lock_file)?;
    let result = f();
    let _ = FileExt::unlock(&lock_file);
    result
}

/// Extends `from` with the complete records written since, and reports how
/// many bytes trail the last newline.
fn scan_extent(file: &mut std::fs::File, from: DiskExtent) -> std::io::Result<(DiskExtent, u64)> {
    // Only torn tails are ever cut, so a shorter file means a foreign rewrite.
    let start = if file.metadata()?.len() < from.byte_len {
        DiskExtent::default()
    } else {
        from
    };
    file.seek(SeekFrom::Start(start.byte_len))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let complete = buf
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let extent = DiskExtent {
        byte_len: start.byte_len + complete as u64,
        records: start.records + count_records(&buf[..complete]),
    };
    Ok((extent, (buf.len() - complete) as u64))
}

/// Appends one line after the last complete record on disk and returns the
/// new extent and the line's offset.
fn append_line(
    path: &Path,
    lock_path: &Path,
    known: DiskExtent,
    line: &[u8],
) -> std::io::Result<(DiskExtent, u64)> {
    with_write_lock(lock_path, || {
        let mut file = open_for_append(path)?;
        let (extent, torn) = scan_extent(&mut file, known)?;
        if torn > 0 {
            // Left by a writer that died holding the lock.
            file.set_len(extent.byte_len)?;
        }
        file.seek(SeekFrom::Start(extent.byte_len))?;
        file.write_all(line)?;
        file.sync_data()?;
        Ok((
            DiskExtent {
                byte_len: extent.byte_len + line.len() as u64,
                records: extent.records + 1,
            },
            extent.records,
        ))
    })
}

/// Complete records currently on disk; readers never need the writer lock.
fn disk_extent(path: &Path, known: DiskExtent) -> std::io::Result<DiskExtent> {
    match std::fs::File::open(path) {
        Ok(mut file) => scan_extent(&mut file, known).map(|(extent, _)| extent),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DiskExtent::default()),
        Err(err) => Err(err),
    }
}

fn count_records(bytes: &[u8]) -> u64 {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .count() as u64
}

#[async_trait]
impl CommandLog for FileCommandLog {
    async fn append(&self, id: &CommandId, payload: &CommandPayload) -> Result<LogPosition> {
        self.ensure_open()?;
        let mut line = encode_record(id, payload)?.into_bytes();
        line.push(b'\n');

        let mut extent = self.shared.extent.lock().await;
        let known = *extent;
        let path = self.shared.path.clone();
        let lock_path = self.shared.lock_path.clone();
        let (next, offset) = spawn_blocking(move || append_line(&path, &lock_path, known, &line))
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;
        *extent = next;
        drop(extent);

        self.shared.appended.notify_waiters();
        Ok(LogPosition(offset))
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Command>> {
        let mut cursor = self.cursor.lock().await;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            let batch = self.read_from(&mut cursor).await?;
            self.position.store(cursor.offset, Ordering::SeqCst);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let _ = timeout_at(deadline, async {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = sleep(FILE_POLL_INTERVAL) => {}
                }
            })
            .await;
        }
    }

    async fn current_end_position(&self) -> Result<LogPosition> {
        self.ensure_open()?;
        let mut extent = self.shared.extent.lock().await;
        let known = *extent;
        let path = self.shared.path.clone();
        let latest = spawn_blocking(move || disk_extent(&path, known))
            .await
            .map_err(unavailable)?
            .map_err(unavailable)?;
        *extent = latest;
        Ok(LogPosition(latest.records))
    }

    async fn seek_to_beginning(&self) -> Result<()> {
        self.ensure_open()?;
        let mut cursor = self.cursor.lock().await;
        *cursor = FileCursor::default();
        self.position.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> LogPosition {
        LogPosition(self.position.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CommandAction, EntityType};
    use tempfile::tempdir;

    fn create(name: &str) -> (CommandId, CommandPayload) {
        (
            CommandId::new(EntityType::Stream, name, CommandAction::Create),
            CommandPayload::new(format!("CREATE STREAM {} (X INT);", name)),
        )
    }

    #[tokio::test]
    async fn appended_records_survive_reopen_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        {
            let log = FileCommandLog::open(&path).await.unwrap();
            for name in ["A", "B", "C"] {
                let (id, payload) = create(name);
                log.append(&id, &payload).await.unwrap();
            }
        }

        let reopened = FileCommandLog::open(&path).await.unwrap();
        assert_eq!(reopened.current_end_position().await.unwrap(), LogPosition(3));

        let batch = reopened.poll(Duration::from_millis(10)).await.unwrap();
        let names: Vec<&str> = batch.iter().map(|c| c.id.entity.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(reopened.position(), LogPosition(3));

        let (id, payload) = create("D");
        assert_eq!(reopened.append(&id, &payload).await.unwrap(), LogPosition(3));
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        {
            let log = FileCommandLog::open(&path).await.unwrap();
            let (id, payload) = create("A");
            log.append(&id, &payload).await.unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"key\":\"stream/B/cre");
        std::fs::write(&path, &raw).unwrap();

        let log = FileCommandLog::open(&path).await.unwrap();
        assert_eq!(log.current_end_position().await.unwrap(), LogPosition(1));
        let batch = log.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);

        let (id, payload) = create("B");
        assert_eq!(log.append(&id, &payload).await.unwrap(), LogPosition(1));
        let batch = log.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch[0].id.entity, "B");
    }

    #[tokio::test]
    async fn independent_handles_agree_on_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");
        let first = FileCommandLog::open(&path).await.unwrap();
        let second = FileCommandLog::open(&path).await.unwrap();

        let mut returned = Vec::new();
        for (log, name) in [(&first, "A"), (&second, "B"), (&first, "C"), (&second, "D")] {
            let (id, payload) = create(name);
            returned.push((name.to_string(), log.append(&id, &payload).await.unwrap().offset()));
        }
        assert_eq!(
            returned,
            vec![
                ("A".to_string(), 0),
                ("B".to_string(), 1),
                ("C".to_string(), 2),
                ("D".to_string(), 3)
            ]
        );

        assert_eq!(first.current_end_position().await.unwrap(), LogPosition(4));
        assert_eq!(second.current_end_position().await.unwrap(), LogPosition(4));

        let reader = FileCommandLog::open(&path).await.unwrap();
        let read: Vec<(String, u64)> = reader
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.id.entity, c.sequence_number))
            .collect();
        assert_eq!(read, returned);
    }

    #[tokio::test]
    async fn concurrent_appends_from_separate_handles_get_distinct_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.log");

        let mut tasks = Vec::new();
        for writer in 0..4 {
            let log = FileCommandLog::open(&path).await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut offsets = Vec::new();
                for n in 0..5 {
                    let (id, payload) = create(&format!("W{}_{}", writer, n));
                    offsets.push((id.entity.clone(), log.append(&id, &payload).await.unwrap()));
                }
                offsets
            }));
        }
        let mut returned = Vec::new();
        for task in tasks {
            returned.extend(task.await.unwrap());
        }

        let reader = FileCommandLog::open(&path).await.unwrap();
        let batch = reader.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 20);
        for (entity, position) in returned {
            assert_eq!(batch[position.offset() as usize].id.entity, entity);
        }
    }

    #[tokio::test]
    async fn sibling_client_poll_wakes_on_append() {
        let dir = tempdir().unwrap();
        let log = FileCommandLog::open(dir.path().join("commands.log"))
            .await
            .unwrap();
        let consumer = log.client();

        let handle = tokio::spawn(async move { consumer.poll(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (id, payload) = create("A");
        log.append(&id, &payload).await.unwrap();

        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence_number, 0);
    }

    #[tokio::test]
    async fn empty_poll_times_out_with_no_records() {
        let dir = tempdir().unwrap();
        let log = FileCommandLog::open(dir.path().join("commands.log"))
            .await
            .unwrap();
        let batch = log.poll(Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(log.position(), LogPosition::START);
    }
}
