//! Sharded in-process key-value store with Redis-style semantics.
//!
//! Keys are assigned to shards by their hash tag (the text between the first
//! `{` and the following `}`), so every key of one project lives on the same
//! shard and a multi-key script can run atomically under that shard's lock.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

type Shard = BTreeMap<String, Value>;

pub struct KvStore {
    shards: Vec<Mutex<Shard>>,
}

impl KvStore {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn slot(&self, key: &str) -> usize {
        crc32fast::hash(hash_tag(key).as_bytes()) as usize % self.shards.len()
    }

    /// Run `script` atomically against the shard that owns `key`. Every key
    /// touched by the script must share that shard.
    pub fn with_shard<T>(&self, key: &str, script: impl FnOnce(&mut KvTxn<'_>) -> Result<T>) -> Result<T> {
        let slot = self.slot(key);
        let mut shard = self.shards[slot].lock();
        let mut txn = KvTxn {
            store: self,
            slot,
            shard: &mut *shard,
        };
        script(&mut txn)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_shard(key, |txn| txn.get(key))
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.with_shard(key, |txn| {
            txn.set(key, value);
            Ok(())
        })
    }

    /// One step of a cluster-wide scan. Returns keys matching the glob
    /// `pattern` from at most `count` examined entries, plus the cursor to
    /// continue from (`None` when every shard is exhausted).
    pub fn scan(&self, cursor: &ScanCursor, pattern: &str, count: usize) -> (Option<ScanCursor>, Vec<String>) {
        let shard = self.shards[cursor.shard].lock();
        let lower = match &cursor.after {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Unbounded,
        };

        let mut matched = Vec::new();
        let mut last = None;
        let mut examined = 0;
        for key in shard.range::<String, _>((lower, Bound::Unbounded)).map(|(k, _)| k) {
            if examined == count.max(1) {
                break;
            }
            examined += 1;
            if glob_match(pattern, key) {
                matched.push(key.clone());
            }
            last = Some(key.clone());
        }

        let shard_done = examined < count.max(1) || last.is_none();
        let next = if !shard_done {
            Some(ScanCursor {
                shard: cursor.shard,
                after: last,
            })
        } else if cursor.shard + 1 < self.shards.len() {
            Some(ScanCursor {
                shard: cursor.shard + 1,
                after: None,
            })
        } else {
            None
        };
        (next, matched)
    }

    /// Lazily iterate batches of matching keys across every shard.
    pub fn scan_keys<'a>(&'a self, pattern: &'a str, count: usize) -> ScanKeys<'a> {
        ScanKeys {
            store: self,
            pattern,
            count,
            cursor: Some(ScanCursor::default()),
        }
    }
}

/// Position of a scan: shard index and the last key returned from it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanCursor {
    shard: usize,
    after: Option<String>,
}

pub struct ScanKeys<'a> {
    store: &'a KvStore,
    pattern: &'a str,
    count: usize,
    cursor: Option<ScanCursor>,
}

impl Iterator for ScanKeys<'_> {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Vec<String>> {
        while let Some(cursor) = self.cursor.take() {
            let (next, keys) = self.store.scan(&cursor, self.pattern, self.count);
            self.cursor = next;
            if !keys.is_empty() {
                return Some(keys);
            }
        }
        None
    }
}

/// Atomic view of one shard.
pub struct KvTxn<'a> {
    store: &'a KvStore,
    slot: usize,
    shard: &'a mut Shard,
}

impl KvTxn<'_> {
    fn check_slot(&self, key: &str) -> Result<()> {
        if self.store.slot(key) != self.slot {
            return Err(StoreError::Invariant(format!("key {key} hashes to a different shard")));
        }
        Ok(())
    }

    fn list_mut(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>> {
        self.check_slot(key)?;
        match self.shard.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(Value::Str(_)) => Err(wrong_type(key)),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_slot(key)?;
        match self.shard.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::List(_)) => Err(wrong_type(key)),
        }
    }

    /// Parse a numeric string value.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)?
            .map(|s| {
                s.parse()
                    .map_err(|_| StoreError::Corruption(format!("non-numeric value at {key}: {s}")))
            })
            .transpose()
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.get(key)?
            .map(|s| {
                s.parse()
                    .map_err(|_| StoreError::Corruption(format!("non-numeric value at {key}: {s}")))
            })
            .transpose()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.shard.insert(key.to_string(), Value::Str(value.into()));
    }

    pub fn del(&mut self, keys: &[&str]) -> usize {
        keys.iter().filter(|k| self.shard.remove(**k).is_some()).count()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.shard.contains_key(key)
    }

    pub fn llen(&mut self, key: &str) -> Result<usize> {
        Ok(self.list_mut(key)?.map_or(0, |l| l.len()))
    }

    /// Append values, returning the new length.
    pub fn rpush(&mut self, key: &str, values: impl IntoIterator<Item = String>) -> Result<usize> {
        self.check_slot(key)?;
        let entry = self
            .shard
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.extend(values);
                Ok(list.len())
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    /// Elements from `start` to `stop` inclusive; negative indexes count
    /// from the end.
    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let Some(list) = self.list_mut(key)? else {
            return Ok(Vec::new());
        };
        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => Ok(list.range(from..=to).cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Keep only elements from `start` to `stop` inclusive.
    pub fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> Result<()> {
        let Some(list) = self.list_mut(key)? else {
            return Ok(());
        };
        match resolve_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => list.clear(),
        }
        if list.is_empty() {
            self.shard.remove(key);
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Invariant(format!("WRONGTYPE operation against key {key}"))
}

/// Clamp Redis-style inclusive indexes to a list of `len` elements.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn hash_tag(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(close) = key[open + 1..].find('}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// Glob matching with `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_tags_share_a_shard() {
        let kv = KvStore::new(8);
        assert_eq!(kv.slot("head:{42}"), kv.slot("changes:{42}"));
        assert_eq!(hash_tag("plain"), "plain");
        assert_eq!(hash_tag("a:{}"), "a:{}");
        kv.with_shard("head:{42}", |txn| {
            txn.set("head-version:{42}", "3");
            txn.rpush("changes:{42}", vec!["a".into(), "b".into()])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(kv.get("head-version:{42}").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn test_list_ranges() {
        let kv = KvStore::new(1);
        kv.with_shard("l", |txn| {
            txn.rpush("l", (0..5).map(|i| i.to_string()))?;
            assert_eq!(txn.lrange("l", -2, -1)?, vec!["3", "4"]);
            assert_eq!(txn.lrange("l", 0, 1)?, vec!["0", "1"]);
            assert_eq!(txn.lrange("l", -10, 0)?, vec!["0"]);
            assert!(txn.lrange("l", 3, 1)?.is_empty());
            txn.ltrim("l", -3, -1)?;
            assert_eq!(txn.lrange("l", 0, -1)?, vec!["2", "3", "4"]);
            txn.ltrim("l", 5, -1)?;
            assert_eq!(txn.llen("l")?, 0);
            assert!(!txn.exists("l"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_wrong_type() {
        let kv = KvStore::new(1);
        kv.set("s", "x").unwrap();
        assert!(kv.with_shard("s", |txn| txn.llen("s")).is_err());
    }

    #[test]
    fn test_scan_keys_across_shards() {
        let kv = KvStore::new(3);
        for i in 0..50 {
            kv.set(&format!("persist-time:{{{i}}}"), "0").unwrap();
            kv.set(&format!("head:{{{i}}}"), "{}").unwrap();
        }
        let mut found: Vec<String> = kv.scan_keys("persist-time:*", 7).flatten().collect();
        found.sort();
        found.dedup();
        assert_eq!(found.len(), 50);
        assert!(found.iter().all(|k| k.starts_with("persist-time:")));
    }

    #[test]
    fn test_glob() {
        assert!(glob_match("expire-time:*", "expire-time:{1}"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*x*", "abxcd"));
        assert!(!glob_match("head:*", "head-version:{1}"));
    }
}
