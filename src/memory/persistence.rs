//! 持久化底座：按命名空间 + ID 读写的键值存储
//!
//! 长期记忆、情景记忆、语义记忆与任务历史都通过 KvStore 落盘；
//! SqliteKvStore 基于 rusqlite（单文件、进程重启后可恢复），InMemoryKvStore 用于测试与无持久化运行。
//! scan 按首次写入顺序返回，供重启后按原顺序重建索引。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::memory::MemoryError;

/// 持久化底座接口
pub trait KvStore: Send + Sync {
    /// 写入（同 ns+id 覆盖，保留首次写入的顺序位置）
    fn put(&self, ns: &str, id: &str, value: &[u8]) -> Result<(), MemoryError>;

    fn get(&self, ns: &str, id: &str) -> Result<Option<Vec<u8>>, MemoryError>;

    /// 按首次写入顺序列出命名空间下全部条目
    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, MemoryError>;

    fn delete(&self, ns: &str, id: &str) -> Result<bool, MemoryError>;

    /// 关闭前调用，默认无操作
    fn flush(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// 序列化为 JSON 后写入
pub fn put_json<T: Serialize>(
    store: &dyn KvStore,
    ns: &str,
    id: &str,
    value: &T,
) -> Result<(), MemoryError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(ns, id, &bytes)
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    ns: &str,
    id: &str,
) -> Result<Option<T>, MemoryError> {
    match store.get(ns, id)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// 读取整个命名空间；无法反序列化的条目跳过并记录告警
pub fn scan_json<T: DeserializeOwned>(store: &dyn KvStore, ns: &str) -> Result<Vec<T>, MemoryError> {
    let rows = store.scan(ns)?;
    let mut out = Vec::with_capacity(rows.len());
    for (id, bytes) in rows {
        match serde_json::from_slice(&bytes) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(ns, id = %id, "Skipping unreadable record: {}", e),
        }
    }
    Ok(out)
}

/// 内存实现：无持久化，进程退出即丢失
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    namespaces: RwLock<HashMap<String, Vec<(String, Vec<u8>)>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn put(&self, ns: &str, id: &str, value: &[u8]) -> Result<(), MemoryError> {
        let mut map = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let rows = map.entry(ns.to_string()).or_default();
        match rows.iter_mut().find(|(k, _)| k == id) {
            Some((_, v)) => *v = value.to_vec(),
            None => rows.push((id.to_string(), value.to_vec())),
        }
        Ok(())
    }

    fn get(&self, ns: &str, id: &str) -> Result<Option<Vec<u8>>, MemoryError> {
        let map = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(ns)
            .and_then(|rows| rows.iter().find(|(k, _)| k == id))
            .map(|(_, v)| v.clone()))
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, MemoryError> {
        let map = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(ns).cloned().unwrap_or_default())
    }

    fn delete(&self, ns: &str, id: &str) -> Result<bool, MemoryError> {
        let mut map = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = map.get_mut(ns) else {
            return Ok(false);
        };
        let before = rows.len();
        rows.retain(|(k, _)| k != id);
        Ok(rows.len() != before)
    }
}

/// SQLite 实现：单表 kv(ns, id, value)，seq 自增列记录首次写入顺序
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ns TEXT NOT NULL,
                id TEXT NOT NULL,
                value BLOB NOT NULL,
                UNIQUE(ns, id)
            );
            CREATE INDEX IF NOT EXISTS idx_kv_ns ON kv(ns, seq);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKvStore {
    fn put(&self, ns: &str, id: &str, value: &[u8]) -> Result<(), MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO kv (ns, id, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(ns, id) DO UPDATE SET value = excluded.value",
            params![ns, id, value],
        )?;
        Ok(())
    }

    fn get(&self, ns: &str, id: &str) -> Result<Option<Vec<u8>>, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE ns = ?1 AND id = ?2",
                params![ns, id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT id, value FROM kv WHERE ns = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map(params![ns], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete(&self, ns: &str, id: &str) -> Result<bool, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let n = conn.execute("DELETE FROM kv WHERE ns = ?1 AND id = ?2", params![ns, id])?;
        Ok(n > 0)
    }

    fn flush(&self) -> Result<(), MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}
