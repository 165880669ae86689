//! Keyed log implementation over a single append-only file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::{LogError, OFFSET_NEWEST, OFFSET_OLDEST};

const LOG_FILE: &str = "records.log";
const CONSUME_BATCH: usize = 32;

/// One record as observed by a consumer.
///
/// `value: None` is a tombstone: the key was deleted at this offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<K, V> {
    pub offset: i64,
    pub key: K,
    pub value: Option<V>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize, V: Serialize"))]
#[serde(bound(deserialize = "K: DeserializeOwned, V: DeserializeOwned"))]
struct StoredRecord<K, V> {
    #[serde(rename = "k")]
    key: K,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    value: Option<V>,
}

struct State<K, V> {
    file: File,
    records: Vec<(K, Option<V>)>,
    latest: HashMap<K, usize>,
}

struct Shared<K, V> {
    state: Mutex<State<K, V>>,
    next: watch::Sender<i64>,
}

/// A durable keyed log; see the crate docs for the contract.
///
/// Cheap to clone; all clones share the same state and file.
pub struct KvLog<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for KvLog<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> KvLog<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) the log stored in `dir`, replaying existing records.
    ///
    /// A torn tail left by an interrupted write is truncated away.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let mut records: Vec<(K, Option<V>)> = Vec::new();
        let mut latest: HashMap<K, usize> = HashMap::new();
        let mut pos = 0usize;
        let mut valid = 0u64;
        loop {
            if data.len() - pos < 4 {
                break;
            }
            let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            if data.len() - pos - 4 < len {
                break;
            }
            let body = &data[pos + 4..pos + 4 + len];
            let record: StoredRecord<K, V> = match serde_json::from_slice(body) {
                Ok(record) => record,
                Err(_) => break,
            };
            latest.insert(record.key.clone(), records.len());
            records.push((record.key, record.value));
            pos += 4 + len;
            valid = pos as u64;
        }

        if valid < data.len() as u64 {
            warn!(path = %path.display(), at = valid, "truncating torn log tail");
            file.set_len(valid)?;
        }
        file.seek(SeekFrom::End(0))?;

        let (next, _) = watch::channel(records.len() as i64);
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    file,
                    records,
                    latest,
                }),
                next,
            }),
        })
    }

    fn append(&self, key: K, value: Option<V>) -> Result<i64, LogError> {
        let body = serde_json::to_vec(&StoredRecord {
            key: key.clone(),
            value: value.clone(),
        })?;

        let mut state = self.shared.state.lock().unwrap();
        state.file.write_all(&(body.len() as u32).to_be_bytes())?;
        state.file.write_all(&body)?;
        state.file.sync_data()?;

        let offset = state.records.len() as i64;
        state.latest.insert(key.clone(), offset as usize);
        state.records.push((key, value));
        drop(state);

        self.shared.next.send_replace(offset + 1);
        Ok(offset)
    }

    /// Append a value for `key`; returns the new record's offset.
    pub fn put(&self, key: K, value: V) -> Result<i64, LogError> {
        self.append(key, Some(value))
    }

    /// Append a tombstone for `key`; returns the new record's offset.
    pub fn del(&self, key: K) -> Result<i64, LogError> {
        self.append(key, None)
    }

    /// The latest value for `key`, or [`LogError::NotFound`] if the key was
    /// never written or its latest record is a tombstone.
    pub fn get(&self, key: &K) -> Result<V, LogError> {
        let state = self.shared.state.lock().unwrap();
        match state.latest.get(key).and_then(|&idx| state.records[idx].1.clone()) {
            Some(value) => Ok(value),
            None => Err(LogError::NotFound),
        }
    }

    /// Like [`get`](Self::get), but a missing key yields `default`.
    pub fn get_or_default(&self, key: &K, default: V) -> Result<V, LogError> {
        match self.get(key) {
            Ok(value) => Ok(value),
            Err(LogError::NotFound) => Ok(default),
            Err(err) => Err(err),
        }
    }

    /// Atomic read-or-create: a missing key is initialized with `init`,
    /// written, and returned.
    pub fn get_or_init(&self, key: K, init: impl FnOnce(&K) -> V) -> Result<V, LogError> {
        match self.get(&key) {
            Ok(value) => Ok(value),
            Err(LogError::NotFound) => {
                let value = init(&key);
                self.put(key, value.clone())?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// The offset the next record will be assigned.
    #[must_use]
    pub fn next_offset(&self) -> i64 {
        *self.shared.next.borrow()
    }

    /// Key-compacted point-in-time view: one message per live key, sorted by
    /// latest-write offset ascending, plus the cursor to resume consuming
    /// from. No record at or past the cursor is included.
    pub fn snapshot(&self) -> Result<(Vec<Message<K, V>>, i64), LogError> {
        let state = self.shared.state.lock().unwrap();
        let mut live: Vec<Message<K, V>> = state
            .latest
            .iter()
            .filter_map(|(key, &idx)| {
                state.records[idx].1.clone().map(|value| Message {
                    offset: idx as i64,
                    key: key.clone(),
                    value: Some(value),
                })
            })
            .collect();
        live.sort_by_key(|msg| msg.offset);
        Ok((live, state.records.len() as i64))
    }

    /// Wait until at least one record exists at `offset >= from`, then return
    /// a batch of messages (tombstones included) and the offset to resume
    /// from. `OFFSET_OLDEST` and `OFFSET_NEWEST` resolve against the log's
    /// current state. Cancel by dropping the future.
    pub async fn consume(&self, from: i64) -> Result<(Vec<Message<K, V>>, i64), LogError> {
        let mut rx = self.shared.next.subscribe();

        let from = match from {
            OFFSET_OLDEST => 0,
            OFFSET_NEWEST => *rx.borrow(),
            offset if offset >= 0 => offset,
            offset => {
                return Err(LogError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid offset: {offset}"),
                )))
            }
        };

        loop {
            {
                let state = self.shared.state.lock().unwrap();
                let next = state.records.len() as i64;
                if from < next {
                    let start = from as usize;
                    let end = (start + CONSUME_BATCH).min(state.records.len());
                    let batch = state.records[start..end]
                        .iter()
                        .enumerate()
                        .map(|(i, (key, value))| Message {
                            offset: (start + i) as i64,
                            key: key.clone(),
                            value: value.clone(),
                        })
                        .collect();
                    return Ok((batch, end as i64));
                }
            }

            // re-check before sleeping: a write may have landed after the
            // lock was released
            if *rx.borrow_and_update() > from {
                continue;
            }
            if rx.changed().await.is_err() {
                return Err(LogError::NotFound);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OFFSET_OLDEST;
    use std::time::Duration;

    fn open(dir: &tempfile::TempDir) -> KvLog<String, u64> {
        KvLog::open(dir.path()).unwrap()
    }

    #[test]
    fn test_put_del_get() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);

        assert!(matches!(log.get(&"a".into()), Err(LogError::NotFound)));

        assert_eq!(log.put("a".into(), 1).unwrap(), 0);
        assert_eq!(log.put("b".into(), 2).unwrap(), 1);
        assert_eq!(log.put("a".into(), 3).unwrap(), 2);
        assert_eq!(log.get(&"a".into()).unwrap(), 3);
        assert_eq!(log.get(&"b".into()).unwrap(), 2);

        assert_eq!(log.del("a".into()).unwrap(), 3);
        assert!(matches!(log.get(&"a".into()), Err(LogError::NotFound)));
        assert_eq!(log.get(&"b".into()).unwrap(), 2);
    }

    #[test]
    fn test_get_or_default_and_init() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);

        assert_eq!(log.get_or_default(&"x".into(), 9).unwrap(), 9);
        assert_eq!(log.get_or_init("x".into(), |_| 5).unwrap(), 5);
        // second init call must observe the stored value
        assert_eq!(log.get_or_init("x".into(), |_| 7).unwrap(), 5);
        assert_eq!(log.get(&"x".into()).unwrap(), 5);
    }

    #[test]
    fn test_snapshot_compacts_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);

        log.put("a".into(), 1).unwrap();
        log.put("b".into(), 2).unwrap();
        log.put("a".into(), 3).unwrap(); // supersedes offset 0
        log.put("c".into(), 4).unwrap();
        log.del("b".into()).unwrap(); // tombstoned keys are absent

        let (msgs, next) = log.snapshot().unwrap();
        assert_eq!(next, 5);
        let entries: Vec<(String, i64, u64)> = msgs
            .into_iter()
            .map(|m| (m.key, m.offset, m.value.unwrap()))
            .collect();
        assert_eq!(
            entries,
            vec![("a".to_string(), 2, 3), ("c".to_string(), 3, 4)]
        );
    }

    #[tokio::test]
    async fn test_consume_returns_existing_batch() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);

        log.put("a".into(), 1).unwrap();
        log.del("a".into()).unwrap();

        let (msgs, next) = log.consume(OFFSET_OLDEST).await.unwrap();
        assert_eq!(next, 2);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].offset, 0);
        assert_eq!(msgs[0].value, Some(1));
        assert_eq!(msgs[1].offset, 1);
        assert_eq!(msgs[1].value, None);
    }

    #[tokio::test]
    async fn test_consume_blocks_until_write() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);
        log.put("a".into(), 1).unwrap();

        let follower = log.clone();
        let task = tokio::spawn(async move { follower.consume(1).await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        log.put("b".into(), 2).unwrap();
        let (msgs, next) = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, 2);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].key, "b");
    }

    #[tokio::test]
    async fn test_consume_batches() {
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);
        for i in 0..80u64 {
            log.put(format!("k{i}"), i).unwrap();
        }

        let (msgs, next) = log.consume(0).await.unwrap();
        assert_eq!(msgs.len(), 32);
        assert_eq!(next, 32);
        let (msgs, next) = log.consume(next).await.unwrap();
        assert_eq!(msgs.len(), 32);
        assert_eq!(next, 64);
        let (msgs, next) = log.consume(next).await.unwrap();
        assert_eq!(msgs.len(), 16);
        assert_eq!(next, 80);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open(&dir);
            log.put("a".into(), 1).unwrap();
            log.put("b".into(), 2).unwrap();
            log.del("a".into()).unwrap();
        }

        let log = open(&dir);
        assert_eq!(log.next_offset(), 3);
        assert!(matches!(log.get(&"a".into()), Err(LogError::NotFound)));
        assert_eq!(log.get(&"b".into()).unwrap(), 2);
        // offsets continue densely after reopen
        assert_eq!(log.put("c".into(), 3).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open(&dir);
            log.put("a".into(), 1).unwrap();
        }

        // simulate a crash mid-write: a length prefix promising more bytes
        // than were flushed
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&(100u32).to_be_bytes()).unwrap();
        file.write_all(b"{\"k\":\"tr").unwrap();
        drop(file);

        let log = open(&dir);
        assert_eq!(log.next_offset(), 1);
        assert_eq!(log.get(&"a".into()).unwrap(), 1);
        // the truncated tail must not corrupt later appends
        assert_eq!(log.put("b".into(), 2).unwrap(), 1);
        let log2 = KvLog::<String, u64>::open(dir.path()).unwrap();
        assert_eq!(log2.get(&"b".into()).unwrap(), 2);
    }

    #[test]
    fn test_snapshot_consume_agree() {
        // a message visible via consume reappears in snapshot at the same
        // offset iff it was not superseded by a later write
        let dir = tempfile::tempdir().unwrap();
        let log = open(&dir);
        log.put("a".into(), 1).unwrap();
        log.put("b".into(), 2).unwrap();
        log.put("a".into(), 3).unwrap();

        let (snap, _) = log.snapshot().unwrap();
        assert!(snap.iter().any(|m| m.key == "a" && m.offset == 2));
        assert!(snap.iter().any(|m| m.key == "b" && m.offset == 1));
        assert!(!snap.iter().any(|m| m.offset == 0));
    }
}
