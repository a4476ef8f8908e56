// state.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceDescriptor;
use crate::types::DownloadId;

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// 正在下载
    Active,
    /// 已暂停，可从 `current_offset` 续传
    Paused,
    /// 整个范围已写入文件
    Finished,
}

/// 持久化的分片信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    /// 分片结束位置（闭区间），大小未知时为 -1
    pub end: i64,
    /// 下一个尚未写入文件的字节位置
    pub current_offset: i64,
    pub status: ChunkStatus,
}

impl ChunkState {
    /// 尚未写入的字节数。大小未知的分片返回 `None`。
    pub fn remaining(&self) -> Option<u64> {
        if self.end < 0 {
            return None;
        }
        Some((self.end + 1 - self.current_offset).max(0) as u64)
    }
}

/// 下载任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Active,
    Paused,
    Finished,
    Cancelled,
}

/// 一次下载的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub file_name: String,
    pub url: String,
    pub file_path: String,
    /// 文件总大小，未知时为 -1
    pub total_size: i64,
    /// 已写入的字节数快照
    pub downloaded: i64,
    pub status: DownloadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub chunks: Vec<ChunkState>,
}

impl DownloadRecord {
    /// 为新下载创建记录，状态为 `Active`。
    pub fn new(id: DownloadId, desc: &ResourceDescriptor, chunks: Vec<ChunkState>) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_name: desc.name.clone(),
            url: desc.url.clone(),
            file_path: desc.file_path.to_string_lossy().into_owned(),
            total_size: desc.total_size_i64(),
            downloaded: 0,
            status: DownloadStatus::Active,
            created_at: now,
            updated_at: now,
            chunks,
        }
    }

    pub fn total_size(&self) -> Option<u64> {
        (self.total_size >= 0).then_some(self.total_size as u64)
    }

    /// 根据各分片的 `current_offset` 计算已经写入文件的字节数。
    ///
    /// 只有刷写过的偏移才可信，因此续传时以此作为计数器初值。
    pub fn flushed_bytes(&self) -> u64 {
        match self.total_size() {
            Some(total) => {
                let remaining: u64 = self.chunks.iter().filter_map(ChunkState::remaining).sum();
                total.saturating_sub(remaining)
            }
            // 大小未知时只有一个从 0 开始的分片
            None => self
                .chunks
                .first()
                .map_or(0, |c| c.current_offset.max(0) as u64),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 一次下载会话（开始或续传）的共享状态。
///
/// 计数器与两个停止信号只属于本会话，所有分片任务和监控器共用同一份。
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: DownloadId,
    /// 文件总大小，未知时为 `None`
    pub total_size: Option<u64>,
    /// 使用原子类型，允许多个分片任务并发累加已接收的字节数
    downloaded: Arc<AtomicU64>,
    /// 暂停：停止并保存续传位置
    pub pause: CancellationToken,
    /// 取消：停止并丢弃整个下载
    pub cancel: CancellationToken,
}

impl SessionState {
    /// 创建会话状态，计数器从 `seed` 开始（续传时为已刷写的字节数）。
    pub fn new(id: DownloadId, total_size: Option<u64>, seed: u64) -> Self {
        Self {
            id,
            total_size,
            downloaded: Arc::new(AtomicU64::new(seed)),
            pause: CancellationToken::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// 获取下载进度 (0.0 to 1.0)
    pub fn fraction(&self) -> f64 {
        match self.total_size {
            Some(0) => 1.0,
            Some(total) => (self.downloaded() as f64 / total as f64).min(1.0),
            None => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_size.is_some_and(|total| self.downloaded() >= total)
    }
}
