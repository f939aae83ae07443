//! Key/value storage capability used by the job store, tenant queues and discovery.
//!
//! Backends:
//! - **RedisStore**: production backend over a shared Redis instance
//! - **InMemoryStore**: single-process keyspace for tests and development
//!
//! Only single commands are atomic. The two compound primitives, `admit` and
//! `hash_set_if`, run as Lua scripts on Redis and under one lock in memory.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{BatchError, ErrorCode, Result};

/// One page of a cursor-based key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; `0` once the walk is complete
    pub cursor: u64,
    /// Keys on this page matching the pattern
    pub keys: Vec<String>,
}

/// Outcome of an atomic admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The record was written and the member enqueued; `depth` is the new length
    Admitted { depth: usize },
    /// Nothing was written; the queue already held `depth` members
    Rejected { depth: usize },
}

/// Storage operations required by the batch subsystem.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set the given hash fields, leaving others untouched.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Read hash fields in order; missing fields (or a missing key) are `None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    /// Set hash fields only if `guard` currently holds one of `expected`.
    async fn hash_set_if(
        &self,
        key: &str,
        guard: &str,
        expected: &[&str],
        fields: &[(&str, String)],
    ) -> Result<bool>;

    /// Expire the key `seconds` from now.
    async fn expire(&self, key: &str, seconds: u64) -> Result<()>;

    /// Remaining time to live; `None` if the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Append to the tail of a list, returning the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<usize>;

    /// Pop the head of a list. Removing the last element removes the key.
    async fn list_pop(&self, key: &str) -> Result<Option<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// One incremental scan step over keys matching a glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage>;

    /// Atomically: if `queue_key` holds fewer than `max` members, write the
    /// record hash and append `member` to the queue.
    async fn admit(
        &self,
        queue_key: &str,
        max: usize,
        record_key: &str,
        fields: &[(&str, String)],
        member: &str,
    ) -> Result<Admission>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

const ADMIT_SCRIPT: &str = r#"
local depth = redis.call('LLEN', KEYS[1])
if depth >= tonumber(ARGV[1]) then
    return {0, depth}
end
for i = 3, #ARGV, 2 do
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
local len = redis.call('RPUSH', KEYS[1], ARGV[2])
return {1, len}
"#;

const HASH_SET_IF_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local expected = tonumber(ARGV[2])
local matched = false
for i = 3, 2 + expected do
    if current == ARGV[i] then
        matched = true
    end
end
if not matched then
    return 0
end
for i = 3 + expected, #ARGV, 2 do
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

/// Redis-backed storage.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    admit_script: redis::Script,
    hash_set_if_script: redis::Script,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379/5`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            BatchError::with_internal(
                ErrorCode::ConfigurationError,
                "Invalid Redis URL",
                e.to_string(),
            )
        })?;
        let conn = redis::aio::ConnectionManager::new(client).await.map_err(|e| {
            BatchError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Failed to get Redis connection for job store",
                e.to_string(),
            )
        })?;

        Ok(Self {
            conn,
            admit_script: redis::Script::new(ADMIT_SCRIPT),
            hash_set_if_script: redis::Script::new(HASH_SET_IF_SCRIPT),
        })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await?;
        Ok(values)
    }

    async fn hash_set_if(
        &self,
        key: &str,
        guard: &str,
        expected: &[&str],
        fields: &[(&str, String)],
    ) -> Result<bool> {
        let mut invocation = self.hash_set_if_script.prepare_invoke();
        invocation.key(key).arg(guard).arg(expected.len());
        for value in expected {
            invocation.arg(*value);
        }
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let applied: i64 = invocation.invoke_async(&mut self.conn()).await?;
        Ok(applied == 1)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async::<_, i64>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(ttl).ok())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let len: usize = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let len: usize = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(ScanPage { cursor, keys })
    }

    async fn admit(
        &self,
        queue_key: &str,
        max: usize,
        record_key: &str,
        fields: &[(&str, String)],
        member: &str,
    ) -> Result<Admission> {
        let mut invocation = self.admit_script.prepare_invoke();
        invocation.key(queue_key).key(record_key).arg(max).arg(member);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }
        let (admitted, depth): (i64, usize) = invocation.invoke_async(&mut self.conn()).await?;

        debug!(queue = queue_key, admitted = admitted == 1, depth, "Admission evaluated");
        Ok(if admitted == 1 {
            Admission::Admitted { depth }
        } else {
            Admission::Rejected { depth }
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: BTreeMap<String, Entry>,
    scans_served: usize,
    fail_scans_after: Option<usize>,
}

impl Keyspace {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(wrong_type(key)),
        }
    }

    fn write_hash(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.live(key);
        let hash = self.hash_mut(key)?;
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    fn list_len(&mut self, key: &str) -> Result<usize> {
        match self.live(key) {
            None => Ok(0),
            Some(Entry { value: Value::List(list), .. }) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_push(&mut self, key: &str, value: &str) -> Result<usize> {
        self.live(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push_back(value.to_string());
                Ok(list.len())
            }
            _ => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> BatchError {
    BatchError::store(
        "A job store error occurred",
        format!("WRONGTYPE Operation against key {} holding the wrong kind of value", key),
    )
}

/// In-memory storage for testing and development.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    keyspace: Mutex<Keyspace>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every scan after the first `pages` fail with a store error.
    pub fn fail_scans_after(&self, pages: usize) {
        let mut keyspace = self.keyspace.lock();
        keyspace.scans_served = 0;
        keyspace.fail_scans_after = Some(pages);
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired();
        keyspace.entries.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keyspace.lock().live(key).is_some()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.keyspace.lock().write_hash(key, fields)
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry { value: Value::Hash(hash), .. }) => {
                Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set_if(
        &self,
        key: &str,
        guard: &str,
        expected: &[&str],
        fields: &[(&str, String)],
    ) -> Result<bool> {
        let mut keyspace = self.keyspace.lock();
        let matched = match keyspace.live(key) {
            None => false,
            Some(Entry { value: Value::Hash(hash), .. }) => hash
                .get(guard)
                .is_some_and(|current| expected.contains(&current.as_str())),
            Some(_) => return Err(wrong_type(key)),
        };
        if matched {
            keyspace.write_hash(key, fields)?;
        }
        Ok(matched)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        if let Some(entry) = self.keyspace.lock().live(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace.live(key).and_then(|entry| {
            entry.expires_at.map(|at| {
                at.saturating_duration_since(Instant::now())
                    .as_secs_f64()
                    .ceil() as u64
            })
        }))
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        self.keyspace.lock().list_push(key, value)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let mut keyspace = self.keyspace.lock();
        let (value, now_empty) = match keyspace.live(key) {
            None => return Ok(None),
            Some(Entry { value: Value::List(list), .. }) => {
                let value = list.pop_front();
                (value, list.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            keyspace.entries.remove(key);
        }
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.keyspace.lock().list_len(key)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock();
        keyspace.live(key);
        let entry = keyspace.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock();
        let now_empty = match keyspace.live(key) {
            None => return Ok(()),
            Some(Entry { value: Value::Set(set), .. }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            keyspace.entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut keyspace = self.keyspace.lock();
        match keyspace.live(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let mut keyspace = self.keyspace.lock();

        keyspace.scans_served += 1;
        if let Some(limit) = keyspace.fail_scans_after {
            if keyspace.scans_served > limit {
                return Err(BatchError::store(
                    "A job store error occurred",
                    "injected scan failure",
                ));
            }
        }

        let matcher = glob_regex(pattern)?;
        keyspace.purge_expired();
        let start = cursor as usize;
        let step = count.max(1);
        let total = keyspace.entries.len();
        let keys = keyspace
            .entries
            .keys()
            .skip(start)
            .take(step)
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        let next = start + step;

        Ok(ScanPage {
            cursor: if next >= total { 0 } else { next as u64 },
            keys,
        })
    }

    async fn admit(
        &self,
        queue_key: &str,
        max: usize,
        record_key: &str,
        fields: &[(&str, String)],
        member: &str,
    ) -> Result<Admission> {
        let mut keyspace = self.keyspace.lock();
        let depth = keyspace.list_len(queue_key)?;
        if depth >= max {
            return Ok(Admission::Rejected { depth });
        }
        keyspace.write_hash(record_key, fields)?;
        let depth = keyspace.list_push(queue_key, member)?;
        Ok(Admission::Admitted { depth })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Compile a Redis `MATCH` glob into an anchored regex.
///
/// Supports `*`, `?`, `[...]` classes with ranges and `^` negation, and `\`
/// escapes. A class left open runs to the end of the pattern.
pub fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str("(?s:.*)"),
            '?' => re.push_str("(?s:.)"),
            '\\' => match chars.next() {
                Some(escaped) => push_literal(&mut re, escaped),
                None => push_literal(&mut re, '\\'),
            },
            '[' => {
                let negated = chars.next_if_eq(&'^').is_some();
                let mut members = Vec::new();
                while let Some(m) = chars.next() {
                    match m {
                        ']' => break,
                        '\\' => members.push(chars.next().unwrap_or('\\')),
                        other => members.push(other),
                    }
                }
                push_class(&mut re, &members, negated);
            }
            other => push_literal(&mut re, other),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| {
        BatchError::store(
            "A job store error occurred",
            format!("invalid key pattern {pattern:?}: {e}"),
        )
    })
}

fn push_literal(re: &mut String, c: char) {
    let mut buf = [0u8; 4];
    re.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn push_class(re: &mut String, members: &[char], negated: bool) {
    if members.is_empty() {
        re.push_str(if negated { "(?s:.)" } else { r"[^\s\S]" });
        return;
    }
    re.push('[');
    if negated {
        re.push('^');
    }
    let mut i = 0;
    while i < members.len() {
        if i + 2 < members.len() && members[i + 1] == '-' {
            let (lo, hi) = (members[i].min(members[i + 2]), members[i].max(members[i + 2]));
            push_literal(re, lo);
            re.push('-');
            push_literal(re, hi);
            i += 3;
        } else {
            push_literal(re, members[i]);
            i += 1;
        }
    }
    re.push(']');
}
