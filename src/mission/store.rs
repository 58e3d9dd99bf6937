//! 任务快照存储
//!
//! 三种后端：
//! - MemoryStore：进程内，测试与临时运行使用
//! - FileStore：每个任务一个 JSON 文件，先写 .tmp 再 rename，启动时清理中断的写入
//! - SqliteStore：rusqlite（bundled），同步连接放在 spawn_blocking 中执行
//!
//! save 返回即视为已持久化；任务在写入成功之前不会继续后续工作。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::fs;
use tokio::sync::RwLock;

use crate::config::{StoreBackend, StoreSection};
use crate::core::{MissionError, Result};
use crate::mission::MissionStateSnapshot;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &MissionStateSnapshot) -> Result<()>;

    async fn load(&self, mission_id: &str) -> Result<Option<MissionStateSnapshot>>;

    /// 所有快照，按创建时间升序
    async fn list(&self) -> Result<Vec<MissionStateSnapshot>>;
}

fn sort_by_creation(snapshots: &mut [MissionStateSnapshot]) {
    snapshots.sort_by(|a, b| {
        a.mission
            .created_at
            .cmp(&b.mission.created_at)
            .then_with(|| a.mission.id.cmp(&b.mission.id))
    });
}

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, MissionStateSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: &MissionStateSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.id().to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, mission_id: &str) -> Result<Option<MissionStateSnapshot>> {
        Ok(self.snapshots.read().await.get(mission_id).cloned())
    }

    async fn list(&self) -> Result<Vec<MissionStateSnapshot>> {
        let mut all: Vec<_> = self.snapshots.read().await.values().cloned().collect();
        sort_by_creation(&mut all);
        Ok(all)
    }
}

/// 每个任务一个 `<id>.json`
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// 创建目录并清理上次中断留下的 .tmp 文件
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { dir: dir.into() };
        fs::create_dir_all(&store.dir).await?;
        store.recover_interrupted_writes().await;
        Ok(store)
    }

    fn snapshot_path(&self, mission_id: &str) -> Result<PathBuf> {
        if mission_id.is_empty()
            || !mission_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MissionError::Validation(format!(
                "invalid mission id for file store: {mission_id}"
            )));
        }
        Ok(self.dir.join(format!("{mission_id}.json")))
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).await?;

        let sync_path = tmp_path.clone();
        match tokio::task::spawn_blocking(move || {
            std::fs::File::open(&sync_path).and_then(|file| file.sync_all())
        })
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to sync snapshot to disk"),
            Err(e) => tracing::warn!(error = %e, "failed to sync snapshot to disk"),
        }

        fs::rename(&tmp_path, path).await?;
        tracing::debug!(path = %path.display(), "snapshot written");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    tracing::debug!(path = %path.display(), "removing interrupted snapshot write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn save(&self, snapshot: &MissionStateSnapshot) -> Result<()> {
        let path = self.snapshot_path(snapshot.id())?;
        let content = serde_json::to_string_pretty(snapshot)?;
        self.write_atomic(&path, &content).await
    }

    async fn load(&self, mission_id: &str) -> Result<Option<MissionStateSnapshot>> {
        let path = self.snapshot_path(mission_id)?;
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| MissionError::Persistence(format!("corrupt snapshot {mission_id}: {e}")))
    }

    async fn list(&self) -> Result<Vec<MissionStateSnapshot>> {
        let mut all = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<MissionStateSnapshot>(&content) {
                Ok(snapshot) => all.push(snapshot),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot")
                }
            }
        }
        sort_by_creation(&mut all);
        Ok(all)
    }
}

/// SQLite 后端：snapshots(id, status, data, created_at, updated_at)
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| MissionError::Persistence(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save(&self, snapshot: &MissionStateSnapshot) -> Result<()> {
        let id = snapshot.id().to_string();
        let status = snapshot.mission.status.name().to_string();
        let created_at = snapshot.mission.created_at.to_rfc3339();
        let updated_at = snapshot.mission.updated_at.to_rfc3339();
        let data = serde_json::to_string(snapshot)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO snapshots (id, status, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                params![id, status, data, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, mission_id: &str) -> Result<Option<MissionStateSnapshot>> {
        let id = mission_id.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM snapshots WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        data.map(|d| serde_json::from_str(&d).map_err(MissionError::from))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<MissionStateSnapshot>> {
        let rows: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT data FROM snapshots ORDER BY created_at, id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        let mut all = rows
            .iter()
            .map(|d| serde_json::from_str(d).map_err(MissionError::from))
            .collect::<Result<Vec<MissionStateSnapshot>>>()?;
        sort_by_creation(&mut all);
        Ok(all)
    }
}

/// 按 [store] 配置打开存储后端
pub async fn open_store(section: &StoreSection) -> Result<Arc<dyn SnapshotStore>> {
    let store: Arc<dyn SnapshotStore> = match section.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(&section.path).await?),
        StoreBackend::Sqlite => {
            let path = section.path.clone();
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(path))
                .await
                .map_err(|e| MissionError::Persistence(format!("sqlite task failed: {e}")))??;
            Arc::new(store)
        }
    };
    tracing::info!(backend = ?section.backend, path = %section.path.display(), "snapshot store opened");
    Ok(store)
}
