//! Key-value store abstraction for cross-worker coordination.
//!
//! The pipeline coordinates through a logically Redis-shaped store: plain
//! strings with TTLs, lists, sets, hashes, and NX-with-expiry writes for
//! locks. This crate defines the [`KeyValueStore`] trait covering exactly
//! the operation families the pipeline uses, plus an in-memory backend that
//! serves as the test/dev implementation.
//!
//! Every mutation in the trait is atomic from the caller's point of view;
//! higher layers (locks, processing state) rely on that and never wrap
//! these calls in their own locking.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// The key holds a value of a different shape (string vs list vs set
    /// vs hash) than the operation expects.
    #[error("key {key} holds a {actual} value, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("key-value backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// The Redis-shaped operations the pipeline coordinates through.
pub trait KeyValueStore: Send + Sync {
    // -- strings --
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Set only if absent, with TTL. Returns whether the write happened.
    /// This is the primitive advisory locks are built on.
    fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;
    fn del(&self, key: &str) -> Result<bool>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    // -- lists --
    fn lpush(&self, key: &str, value: &[u8]) -> Result<u64>;
    fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn llen(&self, key: &str) -> Result<u64>;

    // -- sets --
    fn sadd(&self, key: &str, members: &[String]) -> Result<u64>;
    fn srem(&self, key: &str, members: &[String]) -> Result<u64>;
    /// Atomically move `member` from `src` to `dst`. Returns false when the
    /// member was not in `src`.
    fn smove(&self, src: &str, dst: &str, member: &str) -> Result<bool>;
    fn scard(&self, key: &str) -> Result<u64>;
    /// Sample up to `count` members. Order is unspecified.
    fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>>;
    fn smembers(&self, key: &str) -> Result<Vec<String>>;

    // -- hashes --
    fn hset_all(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()>;
    fn hget_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;
}

enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, Vec<u8>>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory backend with lazy TTL expiry.
///
/// The default backend for tests and single-node development. All state
/// lives behind one mutex; contention is irrelevant at that scale.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| KvError::Backend(e.to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        f(&mut entries)
    }
}

fn wrong_type(key: &str, expected: &'static str, actual: &'static str) -> KvError {
    KvError::WrongType {
        key: key.to_string(),
        expected,
        actual,
    }
}

macro_rules! typed_entry {
    ($entries:expr, $key:expr, $variant:ident, $expected:literal, $default:expr) => {{
        let entry = $entries
            .entry($key.to_string())
            .or_insert_with(|| Entry::live(Value::$variant($default)));
        match &mut entry.value {
            Value::$variant(inner) => Ok(inner),
            other => Err(wrong_type($key, $expected, other.kind())),
        }
    }};
}

impl KeyValueStore for InMemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Str(bytes) => Ok(Some(bytes.clone())),
                other => Err(wrong_type(key, "string", other.kind())),
            },
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), Entry::live(Value::Str(value.to_vec())));
            Ok(())
        })
    }

    fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_vec()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_vec()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    fn del(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.contains_key(key)))
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            None => Ok(false),
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        })
    }

    fn lpush(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.with_entries(|entries| {
            let list = typed_entry!(entries, key, List, "list", VecDeque::new())?;
            list.push_front(value.to_vec());
            Ok(list.len() as u64)
        })
    }

    fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(None);
            };
            let popped = match &mut entry.value {
                Value::List(list) => list.pop_front(),
                other => return Err(wrong_type(key, "list", other.kind())),
            };
            // Redis removes empty aggregates; callers probe with EXISTS.
            if matches!(&entry.value, Value::List(list) if list.is_empty()) {
                entries.remove(key);
            }
            Ok(popped)
        })
    }

    fn llen(&self, key: &str) -> Result<u64> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::List(list) => Ok(list.len() as u64),
                other => Err(wrong_type(key, "list", other.kind())),
            },
        })
    }

    fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.with_entries(|entries| {
            let set = typed_entry!(entries, key, Set, "set", BTreeSet::new())?;
            let mut added = 0;
            for member in members {
                if set.insert(member.clone()) {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(0);
            };
            let removed = match &mut entry.value {
                Value::Set(set) => members.iter().filter(|m| set.remove(*m)).count() as u64,
                other => return Err(wrong_type(key, "set", other.kind())),
            };
            if matches!(&entry.value, Value::Set(set) if set.is_empty()) {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    fn smove(&self, src: &str, dst: &str, member: &str) -> Result<bool> {
        self.with_entries(|entries| {
            let present = match entries.get_mut(src) {
                None => false,
                Some(entry) => match &mut entry.value {
                    Value::Set(set) => set.remove(member),
                    other => return Err(wrong_type(src, "set", other.kind())),
                },
            };
            if !present {
                return Ok(false);
            }
            if matches!(entries.get(src), Some(entry) if matches!(&entry.value, Value::Set(set) if set.is_empty()))
            {
                entries.remove(src);
            }
            let set = typed_entry!(entries, dst, Set, "set", BTreeSet::new())?;
            set.insert(member.to_string());
            Ok(true)
        })
    }

    fn scard(&self, key: &str) -> Result<u64> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.len() as u64),
                other => Err(wrong_type(key, "set", other.kind())),
            },
        })
    }

    fn srandmember(&self, key: &str, count: usize) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().take(count).cloned().collect()),
                other => Err(wrong_type(key, "set", other.kind())),
            },
        })
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                other => Err(wrong_type(key, "set", other.kind())),
            },
        })
    }

    fn hset_all(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        self.with_entries(|entries| {
            let hash = typed_entry!(entries, key, Hash, "hash", BTreeMap::new())?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn hget_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(entry) => match &entry.value {
                Value::Hash(hash) => Ok(hash
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()),
                other => Err(wrong_type(key, "hash", other.kind())),
            },
        })
    }
}
