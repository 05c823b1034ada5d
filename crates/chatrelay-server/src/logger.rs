//! Durable chat log with date- and size-driven rotation.
//!
//! Every relayed message is appended to `chat-YYYY-MM-DD.log` in the log
//! directory. A new file is opened when the local date changes or when the
//! next write would push the file past the size threshold; in the latter
//! case the full file is renamed to `chat-YYYY-MM-DD.N.log` first. After
//! each rotation a detached task trims the directory down to the newest
//! `max_files` files.

use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{Local, NaiveDate, NaiveDateTime};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use chatrelay_shared::{LogEntry, LogError, LogFileName, Message};

/// Source of "now" in local time. Swappable so rotation can be tested.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

struct ActiveFile {
    file: File,
    path: PathBuf,
    date: NaiveDate,
    size: u64,
}

pub struct RotatingLogger {
    dir: PathBuf,
    max_bytes: u64,
    max_files: usize,
    clock: Clock,
    active: Mutex<Option<ActiveFile>>,
    /// Path of the open file, readable by retention tasks without taking
    /// the write lock. Updated before the file is created.
    current: watch::Sender<PathBuf>,
}

impl std::fmt::Debug for RotatingLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingLogger")
            .field("dir", &self.dir)
            .field("max_bytes", &self.max_bytes)
            .field("max_files", &self.max_files)
            .finish_non_exhaustive()
    }
}

impl RotatingLogger {
    /// Create the logger, creating `dir` if missing. No file is opened
    /// until the first append.
    pub async fn new(dir: PathBuf, max_bytes: u64, max_files: usize) -> Result<Self, LogError> {
        Self::with_clock(dir, max_bytes, max_files, Arc::new(|| Local::now().naive_local())).await
    }

    pub async fn with_clock(
        dir: PathBuf,
        max_bytes: u64,
        max_files: usize,
        clock: Clock,
    ) -> Result<Self, LogError> {
        fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), max_bytes, max_files, "Chat log initialized");

        Ok(Self {
            dir,
            max_bytes,
            max_files: max_files.max(1),
            clock,
            active: Mutex::new(None),
            current: watch::channel(PathBuf::new()).0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `[timestamp] author: text` for `msg`, rotating first if the
    /// date changed or the write would exceed the size threshold.
    pub async fn append(&self, msg: &Message) -> Result<(), LogError> {
        let stamp = msg.timestamp().with_timezone(&Local).naive_local();
        let mut line = LogEntry::new(stamp, msg.author(), msg.text()).to_string();
        line.push('\n');
        let len = line.len() as u64;

        let now = (self.clock)();
        let mut active = self.active.lock().await;

        let rotation = match active.as_ref() {
            None => Some(false),
            Some(current) if current.date != now.date() => Some(false),
            Some(current) if current.size > 0 && current.size + len > self.max_bytes => Some(true),
            Some(_) => None,
        };

        if let Some(seal) = rotation {
            self.rotate_locked(&mut active, now.date(), seal).await?;
        }
        let Some(current) = active.as_mut() else {
            return Err(std::io::Error::other("chat log is not open").into());
        };

        let written = match current.file.write_all(line.as_bytes()).await {
            Ok(()) => current.file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // Size is unknown after a partial write; reopen and re-stat next time.
            *active = None;
            return Err(e.into());
        }
        current.size += len;
        Ok(())
    }

    /// Close the current file (if any) and open today's file in append mode.
    pub async fn rotate(&self) -> Result<(), LogError> {
        let now = (self.clock)();
        let mut active = self.active.lock().await;
        self.rotate_locked(&mut active, now.date(), false).await
    }

    async fn rotate_locked(
        &self,
        active: &mut Option<ActiveFile>,
        date: NaiveDate,
        seal: bool,
    ) -> Result<(), LogError> {
        if let Some(mut previous) = active.take() {
            previous.file.flush().await?;
            drop(previous.file);

            if seal {
                let sealed = self.next_segment_path(previous.date).await?;
                fs::rename(&previous.path, &sealed).await?;
                info!(
                    from = %previous.path.display(),
                    to = %sealed.display(),
                    size = previous.size,
                    "Chat log reached size limit"
                );
            }
        }

        let path = self.dir.join(LogFileName::active(date).to_string());
        self.current.send_replace(path.clone());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();

        debug!(path = %path.display(), size, "Opened chat log");
        self.spawn_retention();

        *active = Some(ActiveFile {
            file,
            path,
            date,
            size,
        });
        Ok(())
    }

    async fn next_segment_path(&self, date: NaiveDate) -> Result<PathBuf, LogError> {
        let mut n = 1;
        loop {
            let candidate = self.dir.join(LogFileName::segment(date, n).to_string());
            if !fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Matches the file currently open and today's file, as of the moment
    /// it is asked. Retention checks each candidate just before deleting it.
    fn in_use(&self) -> impl Fn(&Path) -> bool + Send + 'static {
        let current = self.current.subscribe();
        let clock = Arc::clone(&self.clock);
        let dir = self.dir.clone();
        move |path: &Path| {
            current.borrow().as_path() == path
                || dir.join(LogFileName::active(clock().date()).to_string()) == path
        }
    }

    fn spawn_retention(&self) {
        let dir = self.dir.clone();
        let max_files = self.max_files;
        let in_use = self.in_use();
        tokio::spawn(async move {
            match prune(&dir, max_files, in_use).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(removed = ?removed, "Removed old chat logs");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Chat log retention failed"),
            }
        });
    }

    /// Run retention now rather than in the background.
    pub async fn enforce_retention(&self) -> Result<Vec<String>, LogError> {
        prune(&self.dir, self.max_files, self.in_use()).await
    }

    /// Chat log filenames in the directory, sorted by name.
    pub async fn list_files(&self) -> Result<Vec<String>, LogError> {
        let mut names: Vec<String> = scan(&self.dir)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Read a chat log by bare filename. Anything that is not a chat log
    /// name is rejected before touching the filesystem. Invalid UTF-8, such
    /// as a line cut short by a failed write, is replaced rather than
    /// failing the read.
    pub async fn read_file(&self, name: &str) -> Result<String, LogError> {
        let parsed =
            LogFileName::parse(name).ok_or_else(|| LogError::InvalidFileName(name.to_string()))?;
        let path = self.dir.join(parsed.to_string());

        match fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LogError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// Chat log files in `dir` with their modification times.
async fn scan(dir: &Path) -> Result<Vec<(String, SystemTime)>, LogError> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if LogFileName::parse(&name).is_none() {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            // Removed between listing and stat.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        files.push((name, metadata.modified()?));
    }

    Ok(files)
}

/// Delete the oldest chat logs until at most `max_files` remain. Oldest
/// means earliest modification time, ties broken by filename. Files for
/// which `in_use` holds are never deleted. Safe to run concurrently with
/// itself and with rotation.
async fn prune(
    dir: &Path,
    max_files: usize,
    in_use: impl Fn(&Path) -> bool,
) -> Result<Vec<String>, LogError> {
    let mut files = scan(dir).await?;
    if files.len() <= max_files {
        return Ok(Vec::new());
    }

    files.sort_by(|(a_name, a_time), (b_name, b_time)| match a_time.cmp(b_time) {
        Ordering::Equal => a_name.cmp(b_name),
        other => other,
    });

    let excess = files.len() - max_files;
    let mut removed = Vec::with_capacity(excess);

    for (name, _) in files {
        if removed.len() == excess {
            break;
        }
        let path = dir.join(&name);
        if in_use(&path) {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed.push(name),
            // Another retention pass got there first.
            Err(e) if e.kind() == ErrorKind::NotFound => removed.push(name),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(removed)
}
