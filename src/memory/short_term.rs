//! 短期记忆：容量有限、带 TTL 的 LRU 缓存
//!
//! - 容量满时先清理过期条目，仍满则淘汰最久未访问的条目（访问时间相同按插入顺序，先插入先淘汰）
//! - TTL 从最近一次写入起算；过期条目对 get 不可见，在访问时或 sweep 时惰性清理
//! - 每次变更都在同一把互斥锁内完成（条目表与最近访问序列一起更新）

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::memory::item::ShortTermEntry;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, ShortTermEntry>,
    /// (last_access, insertion_seq) -> key，首元素即 LRU 候选
    recency: BTreeMap<(DateTime<Utc>, u64), String>,
    next_seq: u64,
}

impl Inner {
    fn unlink(&mut self, key: &str) -> Option<ShortTermEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&(entry.last_access, entry.insertion_seq));
        Some(entry)
    }

    fn touch(&mut self, key: &str, now: DateTime<Utc>) -> Option<&ShortTermEntry> {
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&(entry.last_access, entry.insertion_seq));
        entry.last_access = now;
        self.recency
            .insert((entry.last_access, entry.insertion_seq), key.to_string());
        Some(entry)
    }
}

#[derive(Debug)]
pub struct ShortTermStore {
    capacity: usize,
    ttl: chrono::Duration,
    inner: Mutex<Inner>,
}

impl Default for ShortTermStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ShortTermStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &ShortTermEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.written_at) > self.ttl
    }

    fn purge_expired(&self, inner: &mut Inner, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            inner.unlink(key);
        }
        expired.len()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.put_at(key, value, Utc::now())
    }

    /// 写入；返回被淘汰的 key（若发生 LRU 淘汰）
    pub fn put_at(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let key = key.into();
        let value = value.into();
        let mut inner = self.lock();

        if let Some(old) = inner.unlink(&key) {
            let entry = ShortTermEntry {
                key: key.clone(),
                value,
                written_at: now,
                last_access: now,
                insertion_seq: old.insertion_seq,
            };
            inner.recency.insert((now, entry.insertion_seq), key.clone());
            inner.entries.insert(key, entry);
            return None;
        }

        let mut evicted = None;
        if inner.entries.len() >= self.capacity {
            self.purge_expired(&mut inner, now);
        }
        if inner.entries.len() >= self.capacity {
            if let Some((_, lru_key)) = inner.recency.pop_first() {
                inner.entries.remove(&lru_key);
                tracing::debug!(key = %lru_key, "Short-term entry evicted (LRU)");
                evicted = Some(lru_key);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.recency.insert((now, seq), key.clone());
        inner.entries.insert(
            key.clone(),
            ShortTermEntry {
                key,
                value,
                written_at: now,
                last_access: now,
                insertion_seq: seq,
            },
        );
        evicted
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now())
    }

    /// 读取并刷新最近访问时间；过期条目视为不存在并被清除
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let mut inner = self.lock();
        let expired = self.is_expired(inner.entries.get(key)?, now);
        if expired {
            inner.unlink(key);
            return None;
        }
        inner.touch(key, now).map(|e| e.value.clone())
    }

    /// 读取但不刷新最近访问时间
    pub fn peek(&self, key: &str) -> Option<ShortTermEntry> {
        self.peek_at(key, Utc::now())
    }

    pub fn peek_at(&self, key: &str, now: DateTime<Utc>) -> Option<ShortTermEntry> {
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<ShortTermEntry> {
        self.lock().unlink(key)
    }

    /// 清除全部过期条目，返回清除数量
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        self.purge_expired(&mut inner, now)
    }

    /// 最近访问的 n 个未过期条目（最新在前），不刷新访问时间
    pub fn recent(&self, n: usize) -> Vec<ShortTermEntry> {
        self.recent_at(n, Utc::now())
    }

    pub fn recent_at(&self, n: usize, now: DateTime<Utc>) -> Vec<ShortTermEntry> {
        let inner = self.lock();
        inner
            .recency
            .values()
            .rev()
            .filter_map(|key| inner.entries.get(key))
            .filter(|e| !self.is_expired(e, now))
            .take(n)
            .cloned()
            .collect()
    }

    /// 当前条目数（可能包含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
