//! 定义库中使用的公共类型、错误、配置和对外事件。
use reqwest::StatusCode;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::state::DownloadStatus;

// --- 公共类型 ---

/// 下载块 ID 的类型别名，即块在计划中的下标。
pub type ChunkId = usize;

/// 下载任务 ID 的类型别名。创建时生成，暂停/续传期间保持不变。
pub type DownloadId = Uuid;

/// 库中通用的 `Result` 类型别名，错误类型为 `DownloadError`。
pub type Result<T> = std::result::Result<T, DownloadError>;

/// 探测远程资源元数据时可能发生的错误。
#[derive(Debug, Error)]
pub enum ProbeError {
    /// 网络请求失败。
    #[error("探测请求失败: {0}")]
    Network(#[from] reqwest::Error),
    /// 服务器返回了非成功状态码。
    #[error("服务器返回了非成功状态码: {0}")]
    BadStatus(StatusCode),
}

/// 分块计划错误。正常输入下不会出现。
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("分块数量必须大于 0")]
    ZeroChunks,
}

/// 单个块下载过程中的错误。
#[derive(Debug, Error)]
pub enum FetchError {
    /// 请求或读取响应流失败。
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    /// 写入输出文件失败。
    #[error("文件 I/O 错误: {0}")]
    FileIo(#[from] io::Error),
    /// 收到暂停或取消信号。这不是真正的错误。
    #[error("下载已被暂停或取消")]
    Canceled,
    /// 服务器忽略了 Range 请求头，返回了整个文件。
    #[error("服务器忽略了范围请求 (起始偏移 {start})")]
    RangeIgnored { start: u64 },
    /// 输出文件已被监控器关闭。
    #[error("输出文件已关闭")]
    FileClosed,
}

impl FetchError {
    /// 是否为暂停/取消信号，而非真实的失败。
    pub fn is_stop_signal(&self) -> bool {
        matches!(self, FetchError::Canceled)
    }
}

/// 状态存储的错误。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("状态文件 I/O 错误: {0}")]
    Io(#[from] io::Error),
    #[error("状态文件解析失败: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("状态文件序列化失败: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("未找到下载记录: {0}")]
    NotFound(DownloadId),
}

/// 定义了库中可能发生的所有公共错误类型。
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// 构建 HTTP 客户端失败。
    #[error("HTTP 客户端构建失败: {0}")]
    Client(#[from] reqwest::Error),
    /// 文件 I/O 错误，例如创建输出文件或下载目录失败。
    #[error("文件 I/O 错误: {0}")]
    Io(#[from] io::Error),
    /// 会话任务执行失败（例如，任务 panic）。
    #[error("并发任务执行失败: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// 记录不处于可续传的状态。
    #[error("下载 {id} 当前状态为 {status:?}，无法续传")]
    NotResumable { id: DownloadId, status: DownloadStatus },
    /// 该下载已有会话在本下载器中运行。
    #[error("下载 {0} 正在运行中")]
    SessionActive(DownloadId),
    /// 无法定位用户主目录。
    #[error("无法定位用户主目录")]
    NoHomeDir,
}

/// 一次下载会话的最终结果。每个会话恰好产生一个。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Paused,
    Cancelled,
}

/// 面向用户的状态和进度信息消息。
///
/// 通过 `Downloader::subscribe` 订阅广播信道来接收。
#[derive(Clone, Debug)]
pub enum DownloadInfo {
    /// 来自监控器的周期性进度更新。
    Progress {
        id: DownloadId,
        /// 完成比例，范围 `[0, 1]`。总大小未知时为 0。
        fraction: f64,
        /// 两次采样之间的吞吐量（字节/秒）。
        speed: f64,
        downloaded: u64,
        /// 文件总大小，未知时为 `None`。
        total: Option<u64>,
    },
    /// 一个块因致命错误被放弃。
    ChunkFailed {
        id: DownloadId,
        chunk: ChunkId,
        error: String,
    },
    /// 下载已暂停，进度已保存。
    Paused { id: DownloadId },
    /// 下载完成。
    Finished { id: DownloadId },
    /// 下载被取消，文件与记录均已删除。
    Removed { id: DownloadId },
}

/// 下载器的配置选项。
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// 进度采样与上报的间隔。
    pub update_interval: Duration,
    /// 每次从网络流读取的最大字节数。
    pub read_buffer_size: usize,
    /// 写入合并缓冲区的刷新阈值。
    pub write_buffer_size: usize,
    /// 事件广播信道的容量。
    pub channel_capacity: usize,
    /// 下载文件的存放目录，不存在时自动创建。
    pub download_dir: PathBuf,
    /// 下载记录 JSON 文件的路径。
    pub store_path: PathBuf,
    /// 任一块发生致命错误时，是否暂停整个下载。
    pub abort_siblings_on_error: bool,
}

impl DownloaderConfig {
    /// 以给定的下载目录和状态文件创建配置，其余选项取默认值。
    pub fn with_paths(download_dir: impl Into<PathBuf>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            update_interval: Duration::from_millis(500),
            read_buffer_size: 256 * 1024,
            write_buffer_size: 1024 * 1024,
            channel_capacity: 1024,
            download_dir: download_dir.into(),
            store_path: store_path.into(),
            abort_siblings_on_error: false,
        }
    }

    /// 基于用户主目录的默认配置：`~/Downloads/DownBitDownloads` 与
    /// `~/DownBit/database/downloads.json`。
    pub fn from_home() -> Result<Self> {
        let download_dir = crate::util::default_download_dir().ok_or(DownloadError::NoHomeDir)?;
        let store_path = crate::util::default_store_path().ok_or(DownloadError::NoHomeDir)?;
        Ok(Self::with_paths(download_dir, store_path))
    }
}

impl Default for DownloaderConfig {
    /// 主目录不可用时退回到当前工作目录。
    fn default() -> Self {
        Self::from_home().unwrap_or_else(|_| {
            Self::with_paths("DownBitDownloads", "DownBit/database/downloads.json")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_canceled_is_a_stop_signal() {
        assert!(FetchError::Canceled.is_stop_signal());
        assert!(!FetchError::FileClosed.is_stop_signal());
        assert!(!FetchError::RangeIgnored { start: 10 }.is_stop_signal());
    }

    #[test]
    fn default_sizes() {
        let config = DownloaderConfig::with_paths("a", "b/c.json");
        assert_eq!(config.update_interval, Duration::from_millis(500));
        assert_eq!(config.write_buffer_size, 1024 * 1024);
        assert_eq!(config.read_buffer_size, 256 * 1024);
        assert!(!config.abort_siblings_on_error);
    }
}
