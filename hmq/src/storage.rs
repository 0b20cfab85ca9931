//! Append-only queue persistence.
//!
//! One log file per queue, records layout:
//! `len u32 LE | op u8 | id_len u16 LE | id | msg_len u32 LE | msg bytes`
//! with `op` 1 = Insert, 2 = Remove. The `len` prefix covers everything
//! after itself. A valid file is either empty or a sequence of complete
//! records; a truncated tail is discarded on replay. The file is rewritten
//! once more than half of its records are tombstoned.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use hmq_codec::codec::{frame_from_bytes, frame_to_bytes};
use hmq_codec::Frame;

use crate::types::{DashMap, HashMap, QueueName};

const OP_INSERT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Durable write-behind target of a queue. The default implementation keeps
/// everything volatile.
#[async_trait]
pub trait QueueStorage: Sync + Send {
    /// Whether saves actually persist anything.
    #[inline]
    fn enable(&self) -> bool {
        false
    }

    ///Append the message to the queue's log; returns whether it was stored.
    #[inline]
    async fn save(&self, _queue: &str, _frame: &Frame) -> Result<bool> {
        Ok(false)
    }

    ///Tombstone a previously saved message.
    #[inline]
    async fn remove(&self, _queue: &str, _message_id: &str) -> Result<()> {
        Ok(())
    }

    ///Replay the queue's log, oldest first, removals applied.
    #[inline]
    async fn load(&self, _queue: &str) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }

    ///Rewrite the log, dropping tombstoned records.
    #[inline]
    async fn compact(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    ///Delete the queue's log entirely.
    #[inline]
    async fn drop_queue(&self, _queue: &str) -> Result<()> {
        Ok(())
    }
}

pub struct NullStorage;

impl QueueStorage for NullStorage {}

struct LogFile {
    path: PathBuf,
    file: File,
    records: usize,
    tombstones: usize,
}

/// File-backed storage. All file work runs on the blocking thread pool;
/// the owning queue actor awaits it, so a slow disk suspends that queue
/// and nothing else.
pub struct FileStorage {
    dir: PathBuf,
    files: DashMap<QueueName, Arc<Mutex<LogFile>>>,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, files: DashMap::default() })
    }

    fn file_path(&self, queue: &str) -> PathBuf {
        let name: String = queue
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.hmq"))
    }

    async fn open(&self, queue: &str) -> Result<Arc<Mutex<LogFile>>> {
        if let Some(f) = self.files.get(queue) {
            return Ok(f.value().clone());
        }
        let path = self.file_path(queue);
        let log = tokio::task::spawn_blocking(move || -> Result<LogFile> {
            let file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
            let (records, tombstones) = scan_counts(&path)?;
            Ok(LogFile { path, file, records, tombstones })
        })
        .await??;
        let log = Arc::new(Mutex::new(log));
        self.files.insert(QueueName::from(queue), log.clone());
        Ok(log)
    }

    fn append(log: &mut LogFile, op: u8, id: &str, msg: Option<&[u8]>) -> Result<()> {
        let id = id.as_bytes();
        if id.len() > u16::MAX as usize {
            return Err(anyhow!("message id too long"));
        }
        let msg = msg.unwrap_or_default();
        let body_len = 1 + 2 + id.len() + 4 + msg.len();
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.push(op);
        buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
        buf.extend_from_slice(id);
        buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        buf.extend_from_slice(msg);
        log.file.write_all(&buf)?;
        log.file.flush()?;
        Ok(())
    }

    fn rewrite(log: &mut LogFile) -> Result<()> {
        let live = replay(&log.path)?;
        let tmp = log.path.with_extension("hmq.tmp");
        {
            let mut out = File::create(&tmp)?;
            for (id, frame) in &live {
                let msg = frame_to_bytes(frame).map_err(|e| anyhow!(e))?;
                let id = id.as_bytes();
                let body_len = 1 + 2 + id.len() + 4 + msg.len();
                out.write_all(&(body_len as u32).to_le_bytes())?;
                out.write_all(&[OP_INSERT])?;
                out.write_all(&(id.len() as u16).to_le_bytes())?;
                out.write_all(id)?;
                out.write_all(&(msg.len() as u32).to_le_bytes())?;
                out.write_all(&msg)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &log.path)?;
        log.file = OpenOptions::new().create(true).read(true).append(true).open(&log.path)?;
        log.records = live.len();
        log.tombstones = 0;
        Ok(())
    }
}

#[async_trait]
impl QueueStorage for FileStorage {
    #[inline]
    fn enable(&self) -> bool {
        true
    }

    async fn save(&self, queue: &str, frame: &Frame) -> Result<bool> {
        let msg = frame_to_bytes(frame).map_err(|e| anyhow!(e))?;
        let id = frame.message_id.clone();
        let log = self.open(queue).await?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut log = log.lock();
            Self::append(&mut log, OP_INSERT, &id, Some(msg.as_ref()))?;
            log.records += 1;
            Ok(())
        })
        .await??;
        Ok(true)
    }

    async fn remove(&self, queue: &str, message_id: &str) -> Result<()> {
        let message_id = message_id.to_string();
        let log = self.open(queue).await?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut log = log.lock();
            Self::append(&mut log, OP_REMOVE, &message_id, None)?;
            log.tombstones += 1;
            if log.tombstones * 2 > log.records {
                Self::rewrite(&mut log)?;
            }
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn load(&self, queue: &str) -> Result<Vec<Frame>> {
        let log = self.open(queue).await?;
        tokio::task::spawn_blocking(move || -> Result<Vec<Frame>> {
            let log = log.lock();
            Ok(replay(&log.path)?.into_iter().map(|(_, f)| f).collect())
        })
        .await?
    }

    async fn compact(&self, queue: &str) -> Result<()> {
        let log = self.open(queue).await?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut log = log.lock();
            Self::rewrite(&mut log)
        })
        .await?
    }

    async fn drop_queue(&self, queue: &str) -> Result<()> {
        let path = match self.files.remove(queue) {
            Some((_, log)) => log.lock().path.clone(),
            None => self.file_path(queue),
        };
        tokio::task::spawn_blocking(move || -> Result<()> {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            Ok(())
        })
        .await??;
        Ok(())
    }
}

/// Parses a log file into its live, insertion-ordered messages. A removal
/// cancels the prior insert with the same id; incomplete trailing bytes are
/// ignored.
fn replay(path: &Path) -> Result<Vec<(String, Frame)>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut live: Vec<(String, Option<Frame>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::default();

    let mut pos = 0usize;
    while let Some((op, id, msg, next)) = read_record(&data, pos) {
        match op {
            OP_INSERT => {
                if let Ok(frame) = frame_from_bytes(msg) {
                    index.insert(id.clone(), live.len());
                    live.push((id, Some(frame)));
                }
            }
            OP_REMOVE => {
                if let Some(idx) = index.remove(&id) {
                    live[idx].1 = None;
                }
            }
            _ => {
                log::warn!("unknown op {} in {:?}, stopping replay", op, path);
                break;
            }
        }
        pos = next;
    }
    if pos < data.len() {
        log::warn!("discarding {} trailing bytes of {:?}", data.len() - pos, path);
    }

    Ok(live.into_iter().filter_map(|(id, f)| f.map(|f| (id, f))).collect())
}

/// One record at `pos`; `None` when the remaining bytes do not hold a
/// complete record.
fn read_record(data: &[u8], pos: usize) -> Option<(u8, String, &[u8], usize)> {
    let rest = data.get(pos..)?;
    if rest.len() < 4 {
        return None;
    }
    let body_len = u32::from_le_bytes(rest[..4].try_into().ok()?) as usize;
    let body = rest.get(4..4 + body_len)?;
    if body.len() < 3 {
        return None;
    }
    let op = body[0];
    let id_len = u16::from_le_bytes(body[1..3].try_into().ok()?) as usize;
    let id_end = 3 + id_len;
    if body.len() < id_end + 4 {
        return None;
    }
    let id = String::from_utf8(body[3..id_end].to_vec()).ok()?;
    let msg_len = u32::from_le_bytes(body[id_end..id_end + 4].try_into().ok()?) as usize;
    let msg = body.get(id_end + 4..id_end + 4 + msg_len)?;
    Some((op, id, msg, pos + 4 + body_len))
}

fn scan_counts(path: &Path) -> Result<(usize, usize)> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    }
    let mut records = 0;
    let mut tombstones = 0;
    let mut pos = 0usize;
    while let Some((op, _, _, next)) = read_record(&data, pos) {
        match op {
            OP_INSERT => records += 1,
            OP_REMOVE => tombstones += 1,
            _ => break,
        }
        pos = next;
    }
    Ok((records, tombstones))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_codec::MessageType;

    fn frame(id: &str, body: &str) -> Frame {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id(id).set_source("p").set_target("q");
        f.set_content_string(body);
        f
    }

    fn temp_storage() -> (FileStorage, PathBuf) {
        let dir = std::env::temp_dir().join(format!("hmq-storage-{}", uuid::Uuid::new_v4().as_simple()));
        (FileStorage::new(&dir).unwrap(), dir)
    }

    #[tokio::test]
    async fn replay_preserves_order_minus_removed() {
        let (storage, dir) = temp_storage();
        for i in 0..5 {
            storage.save("orders", &frame(&format!("m{i}"), &format!("body-{i}"))).await.unwrap();
        }
        storage.remove("orders", "m2").await.unwrap();

        let frames = storage.load("orders").await.unwrap();
        let ids: Vec<_> = frames.iter().map(|f| f.message_id.to_string()).collect();
        assert_eq!(ids, ["m0", "m1", "m3", "m4"]);

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn truncated_tail_is_discarded() {
        let (storage, dir) = temp_storage();
        storage.save("q", &frame("m0", "zero")).await.unwrap();
        storage.save("q", &frame("m1", "one")).await.unwrap();

        // chop off the final few bytes, simulating a crash mid-append
        let path = storage.file_path("q");
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 3]).unwrap();
        storage.files.clear();

        let frames = storage.load("q").await.unwrap();
        let ids: Vec<_> = frames.iter().map(|f| f.message_id.to_string()).collect();
        assert_eq!(ids, ["m0"]);

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn compaction_drops_tombstones() {
        let (storage, dir) = temp_storage();
        for i in 0..4 {
            storage.save("q", &frame(&format!("m{i}"), "x")).await.unwrap();
        }
        // removing 3 of 4 crosses the half-tombstoned threshold
        storage.remove("q", "m0").await.unwrap();
        storage.remove("q", "m1").await.unwrap();
        storage.remove("q", "m2").await.unwrap();

        let (records, tombstones) = scan_counts(&storage.file_path("q")).unwrap();
        assert_eq!((records, tombstones), (1, 0));

        let frames = storage.load("q").await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_id, "m3");

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn drop_queue_deletes_the_log() {
        let (storage, dir) = temp_storage();
        storage.save("q", &frame("m0", "x")).await.unwrap();
        let path = storage.file_path("q");
        assert!(path.exists());
        storage.drop_queue("q").await.unwrap();
        assert!(!path.exists());

        fs::remove_dir_all(dir).ok();
    }
}
