//! 下载记录的持久化：单个 JSON 文件，每次修改都整体重写。

use crate::state::DownloadRecord;
use crate::types::{DownloadId, StoreError};
use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// 基于 JSON 文件的下载记录存储。
///
/// 文件内容是 `DownloadRecord` 的数组。所有读写都经过同一把锁，
/// 同一时刻只有一个读-改-写在进行。
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录。文件不存在或为空时返回空集合。
    pub async fn load_all(&self) -> Result<Vec<DownloadRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_records().await
    }

    /// 按 ID 查找记录。
    pub async fn find_by_id(&self, id: DownloadId) -> Result<DownloadRecord, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_records()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    /// 插入或替换同 ID 的记录，然后重写整个文件。
    pub async fn upsert(&self, record: &DownloadRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_records(&records).await?;
        debug!("[Store] 已保存记录 {} ({:?})。", record.id, record.status);
        Ok(())
    }

    /// 删除记录。记录不存在时返回 `NotFound`。
    pub async fn remove(&self, id: DownloadId) -> Result<DownloadRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        let pos = records
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        let removed = records.remove(pos);
        self.write_records(&records).await?;
        info!("[Store] 已删除记录 {id}。");
        Ok(removed)
    }

    async fn read_records(&self) -> Result<Vec<DownloadRecord>, StoreError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data).map_err(StoreError::Decode)
    }

    /// 先写临时文件再重命名，中途崩溃不会留下半个 JSON。
    async fn write_records(&self, records: &[DownloadRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(records).map_err(StoreError::Encode)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".downloads.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, &json).await?;
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceDescriptor;
    use crate::state::{ChunkState, ChunkStatus, DownloadStatus};
    use uuid::Uuid;

    fn record(name: &str) -> DownloadRecord {
        let desc = ResourceDescriptor {
            name: name.into(),
            total_size: Some(10),
            file_path: format!("/tmp/{name}").into(),
            url: format!("http://x.test/{name}"),
            accept_ranges: true,
        };
        DownloadRecord::new(
            Uuid::new_v4(),
            &desc,
            vec![ChunkState {
                end: 9,
                current_offset: 0,
                status: ChunkStatus::Active,
            }],
        )
    }

    #[tokio::test]
    async fn missing_or_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("db").join("downloads.json"));
        assert!(store.load_all().await.unwrap().is_empty());

        std::fs::write(dir.path().join("empty.json"), "  \n").unwrap();
        let store = StateStore::new(dir.path().join("empty.json"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("db").join("downloads.json"));

        let mut a = record("a.bin");
        let b = record("b.bin");
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 2);

        a.status = DownloadStatus::Paused;
        a.chunks[0].current_offset = 4;
        store.upsert(&a).await.unwrap();
        store.upsert(&a).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], a);
        assert_eq!(store.find_by_id(b.id).await.unwrap(), b);
    }

    #[tokio::test]
    async fn find_and_remove_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("downloads.json"));
        let id = Uuid::new_v4();
        assert!(matches!(store.find_by_id(id).await, Err(StoreError::NotFound(x)) if x == id));
        assert!(matches!(store.remove(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("downloads.json"));
        let a = record("a.bin");
        let b = record("b.bin");
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        assert_eq!(store.remove(a.id).await.unwrap().id, a.id);
        let all = store.load_all().await.unwrap();
        assert_eq!(all, vec![b]);

        // 临时文件不会残留
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downloads.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::new(&path);
        assert!(matches!(store.load_all().await, Err(StoreError::Decode(_))));
    }
}
