//! 一个支持分块并行、暂停与断点续传的 HTTP 下载引擎。
//!
//! # 核心特性
//!
//! - **分块并行下载**：按文件大小把文件切分成 1、5、8 或 15 个块，每个块由独立任务通过范围请求下载。
//! - **定位写入**：各块把数据写到共享输出文件的各自偏移处，互不竞争文件游标。
//! - **暂停与续传**：暂停时每个块先刷写缓冲区，再把已写入的偏移持久化；续传时只下载剩余部分。
//! - **取消**：取消会删除部分文件和对应的记录。
//! - **异步 IO**：完全基于 `tokio` 构建。
//! - **自定义客户端**：允许用户通过 `reqwest::ClientBuilder` 自定义 HTTP 客户端（例如，设置代理、超时、自定义头等）。
//!
//! # 架构
//!
//! - **`Downloader`**: 系统入口。负责探测资源、计算分块计划、启动会话，并在会话结束后持久化结果。
//! - **块任务**: 每个块一个，下载一个字节范围并写入文件，返回该块最终的偏移与状态。
//! - **监控器**: 每个会话一个，周期性采样共享计数器并广播进度。它是唯一关闭输出文件的地方，
//!   并决定会话的唯一结果（完成、暂停或取消）。
//! - **`StateStore`**: 以单个 JSON 文件保存所有下载记录。
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use downbit::{DownloadInfo, Downloader, DownloaderConfig, Outcome};
//!
//! #[tokio::main]
//! async fn main() -> downbit::Result<()> {
//!     let config = DownloaderConfig::from_home()?;
//!     let downloader = Downloader::new(config, reqwest::ClientBuilder::new)?;
//!
//!     let mut info_rx = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(info) = info_rx.recv().await {
//!             if let DownloadInfo::Progress { fraction, speed, .. } = info {
//!                 println!(
//!                     "下载进度: {:.2}%, 速度: {:.2} MB/s",
//!                     fraction * 100.0,
//!                     speed / 1024.0 / 1024.0
//!                 );
//!             }
//!         }
//!     });
//!
//!     let handle = downloader.start("https://example.com/largefile.zip").await?;
//!     match handle.wait().await? {
//!         Outcome::Finished => println!("下载成功！"),
//!         Outcome::Paused => println!("下载已暂停，可稍后续传。"),
//!         Outcome::Cancelled => println!("下载已取消。"),
//!     }
//!     Ok(())
//! }
//! ```

mod chunk;
mod downloader;
mod file;
mod monitor;
pub mod plan;
pub mod resource;
pub mod state;
pub mod store;
mod types;
pub mod util;

// --- 公共 API 导出 ---

// 导出核心的 `Downloader`，它是用户的主要入口点。
pub use downloader::{Downloader, SessionHandle};
// 重新导出 `reqwest`，允许用户提供自定义的 `ClientBuilder`。
pub use reqwest;
pub use resource::ResourceDescriptor;
pub use state::{ChunkState, ChunkStatus, DownloadRecord, DownloadStatus};
pub use store::StateStore;
// 导出公共类型，方便用户在类型注解和模式匹配中使用。
pub use types::{
    ChunkId, DownloadError, DownloadId, DownloadInfo, DownloaderConfig, FetchError, Outcome,
    PlanError, ProbeError, Result, StoreError,
};
