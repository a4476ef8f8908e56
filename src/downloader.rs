//! downloader.rs - 下载控制器与系统入口。

use crate::chunk::{ChunkContext, chunk_run};
use crate::file::OutputFile;
use crate::monitor::ProgressMonitor;
use crate::plan::{plan, resume_ranges, split};
use crate::resource::probe;
use crate::state::{ChunkState, ChunkStatus, DownloadRecord, DownloadStatus, SessionState};
use crate::store::StateStore;
use crate::types::{
    ChunkId, DownloadError, DownloadId, DownloadInfo, DownloaderConfig, Outcome, Result, StoreError,
};
use faststr::FastStr;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use log::{debug, error, info, warn};
use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::spawn;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 一个待执行的块任务：在 `chunks` 中的下标与本次要下载的范围。
#[derive(Debug, Clone, Copy)]
struct ChunkJob {
    id: ChunkId,
    start: u64,
    end: Option<u64>,
}

/// 本下载器中正在运行的下载 ID。
#[derive(Debug, Default, Clone)]
struct LiveSessions(Arc<Mutex<HashSet<DownloadId>>>);

impl LiveSessions {
    /// 登记一个会话；该 ID 已在运行时返回 `None`。
    fn claim(&self, id: DownloadId) -> Option<LiveClaim> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| LiveClaim {
            sessions: self.clone(),
            id,
        })
    }

    fn contains(&self, id: DownloadId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// 会话结束（或启动失败）时释放登记。
#[derive(Debug)]
struct LiveClaim {
    sessions: LiveSessions,
    id: DownloadId,
}

impl Drop for LiveClaim {
    fn drop(&mut self) {
        self.sessions
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// 下载器，负责探测、分块、启动会话以及持久化结果。
///
/// 同一个下载器可以同时运行多个会话，它们共享 HTTP 客户端、状态存储和事件信道。
pub struct Downloader {
    client: Client,
    store: Arc<StateStore>,
    config: DownloaderConfig,
    info_tx: broadcast::Sender<DownloadInfo>,
    live: LiveSessions,
}

impl Downloader {
    /// 创建下载器。`client_builder` 用于自定义 HTTP 客户端（代理、超时、请求头等）。
    pub fn new<F>(config: DownloaderConfig, client_builder: F) -> Result<Self>
    where
        F: Fn() -> ClientBuilder,
    {
        let client = client_builder().build()?;
        let (info_tx, _) = broadcast::channel(config.channel_capacity);
        let store = Arc::new(StateStore::new(config.store_path.clone()));
        debug!("[Downloader] 已创建，下载目录 {}。", config.download_dir.display());
        Ok(Self {
            client,
            store,
            config,
            info_tx,
            live: LiveSessions::default(),
        })
    }

    /// 订阅所有会话的进度与状态事件。
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadInfo> {
        self.info_tx.subscribe()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// 列出所有已持久化的下载记录。
    pub async fn list(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.store.load_all().await?)
    }

    /// 开始一个新的下载。
    ///
    /// 探测与创建文件的错误直接返回；之后的过程在后台进行，通过返回的句柄控制。
    pub async fn start(&self, url: impl Into<FastStr>) -> Result<SessionHandle> {
        let url: FastStr = url.into();
        info!("[Downloader] 开始下载: {url}");

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let desc = probe(&self.client, url.as_str(), &self.config.download_dir).await?;
        info!(
            "[Downloader] 文件 '{}'，大小 {:?} 字节，支持范围请求: {}。",
            desc.name, desc.total_size, desc.accept_ranges
        );

        let jobs: Vec<ChunkJob> = match desc.total_size {
            Some(0) => Vec::new(),
            Some(total) if desc.accept_ranges => plan(total)
                .into_iter()
                .enumerate()
                .map(|(id, r)| ChunkJob {
                    id,
                    start: r.start,
                    end: Some(r.end),
                })
                .collect(),
            Some(total) => {
                warn!("[Downloader] 服务器未声明支持范围请求，使用单个块。");
                split(total, 1)?
                    .into_iter()
                    .map(|r| ChunkJob {
                        id: 0,
                        start: r.start,
                        end: Some(r.end),
                    })
                    .collect()
            }
            None => {
                warn!("[Downloader] 文件大小未知，使用单个不限长度的块。");
                vec![ChunkJob {
                    id: 0,
                    start: 0,
                    end: None,
                }]
            }
        };
        debug!("[Downloader] 分块计划: {jobs:?}");

        let file = OutputFile::create(&desc.file_path, desc.total_size).await?;
        let chunks = jobs
            .iter()
            .map(|job| ChunkState {
                end: job.end.map_or(-1, |e| e as i64),
                current_offset: job.start as i64,
                status: ChunkStatus::Active,
            })
            .collect();
        let record = DownloadRecord::new(Uuid::new_v4(), &desc, chunks);
        let claim = self
            .live
            .claim(record.id)
            .ok_or(DownloadError::SessionActive(record.id))?;
        self.store.upsert(&record).await?;

        Ok(self.launch(claim, record, file, jobs, 0, url))
    }

    /// 续传一个已暂停（或上次未正常结束）的下载，沿用原来的 ID。
    ///
    /// 同一下载在本下载器中已有会话运行时返回 `SessionActive`。
    pub async fn resume(&self, id: DownloadId) -> Result<SessionHandle> {
        let claim = self.live.claim(id).ok_or(DownloadError::SessionActive(id))?;
        let mut record = self.store.find_by_id(id).await?;
        if !matches!(record.status, DownloadStatus::Paused | DownloadStatus::Active) {
            return Err(DownloadError::NotResumable {
                id,
                status: record.status,
            });
        }
        info!("[Downloader] 续传下载 {id}: {}", record.file_name);

        let jobs: Vec<ChunkJob> = record
            .chunks
            .iter()
            .zip(resume_ranges(&record.chunks))
            .enumerate()
            .filter_map(|(id, (chunk, range))| match range {
                Some(r) => Some(ChunkJob {
                    id,
                    start: r.start,
                    end: Some(r.end),
                }),
                // 大小未知的块只能从已写入的位置继续读到流结束
                None if chunk.end < 0 && chunk.status != ChunkStatus::Finished => Some(ChunkJob {
                    id,
                    start: chunk.current_offset.max(0) as u64,
                    end: None,
                }),
                None => None,
            })
            .collect();
        let seed = record.flushed_bytes();
        debug!("[Downloader] 续传计划: {jobs:?}，已写入 {seed} 字节。");

        let file = OutputFile::open_existing(&record.file_path).await?;
        record.status = DownloadStatus::Active;
        record.touch();
        self.store.upsert(&record).await?;

        let url = FastStr::new(&record.url);
        Ok(self.launch(claim, record, file, jobs, seed, url))
    }

    /// 删除一个不在运行中的下载：删除记录，未完成时同时删除文件。
    ///
    /// 运行中的下载应通过 `SessionHandle::cancel` 取消。
    pub async fn cancel_by_id(&self, id: DownloadId) -> Result<()> {
        if self.live.contains(id) {
            return Err(DownloadError::SessionActive(id));
        }
        let record = self.store.find_by_id(id).await?;
        if record.status != DownloadStatus::Finished {
            remove_file_if_exists(Path::new(&record.file_path)).await?;
        }
        self.store.remove(id).await?;
        info!("[Downloader] 已删除下载 {id}。");
        let _ = self.info_tx.send(DownloadInfo::Removed { id });
        Ok(())
    }

    /// 启动监控器和会话任务。
    fn launch(
        &self,
        claim: LiveClaim,
        record: DownloadRecord,
        file: OutputFile,
        jobs: Vec<ChunkJob>,
        seed: u64,
        url: FastStr,
    ) -> SessionHandle {
        let session = SessionState::new(record.id, record.total_size(), seed);
        let file = Arc::new(file);
        let (settled_tx, settled_rx) = oneshot::channel();

        let monitor = ProgressMonitor::new(
            session.clone(),
            file.clone(),
            self.info_tx.clone(),
            self.config.update_interval,
            settled_rx,
        );
        let monitor_handle = spawn(monitor.run());
        debug!("[Downloader] 下载 {} 的监控器已启动。", record.id);

        let runner = SessionRunner {
            client: self.client.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            info_tx: self.info_tx.clone(),
            session: session.clone(),
            file,
            url,
            record,
            _claim: claim,
        };
        let join = spawn(runner.run(jobs, settled_tx, monitor_handle));

        SessionHandle {
            id: session.id,
            pause: session.pause,
            cancel: session.cancel,
            join,
        }
    }
}

/// 一个运行中会话的控制句柄。
///
/// `pause` 与 `cancel` 只发出信号，不等待；调用 `wait` 获取会话结果。
#[derive(Debug)]
pub struct SessionHandle {
    id: DownloadId,
    pause: CancellationToken,
    cancel: CancellationToken,
    join: JoinHandle<Result<Outcome>>,
}

impl SessionHandle {
    pub fn id(&self) -> DownloadId {
        self.id
    }

    /// 暂停下载，保存续传位置。
    pub fn pause(&self) {
        info!("[Downloader] 请求暂停 {}。", self.id);
        self.pause.cancel();
    }

    /// 暂停信号的副本，可在 `wait` 消耗句柄之后继续用来暂停。
    pub fn pause_signal(&self) -> CancellationToken {
        self.pause.clone()
    }

    /// 取消下载，删除文件与记录。
    pub fn cancel(&self) {
        info!("[Downloader] 请求取消 {}。", self.id);
        self.cancel.cancel();
    }

    /// 等待会话结束并返回其结果。
    pub async fn wait(self) -> Result<Outcome> {
        self.join.await?
    }
}

/// 会话任务持有的全部上下文。
struct SessionRunner {
    client: Client,
    store: Arc<StateStore>,
    config: DownloaderConfig,
    info_tx: broadcast::Sender<DownloadInfo>,
    session: SessionState,
    file: Arc<OutputFile>,
    url: FastStr,
    record: DownloadRecord,
    _claim: LiveClaim,
}

impl SessionRunner {
    async fn run(
        mut self,
        jobs: Vec<ChunkJob>,
        settled_tx: oneshot::Sender<bool>,
        monitor_handle: JoinHandle<Outcome>,
    ) -> Result<Outcome> {
        let id = self.session.id;
        info!("[Downloader] 下载 {id} 启动 {} 个块任务。", jobs.len());

        let mut tasks: FuturesUnordered<_> = jobs
            .into_iter()
            .map(|job| {
                let ctx = ChunkContext {
                    id: job.id,
                    req_builder: self.client.get(self.url.as_str()),
                    file: self.file.clone(),
                    session: self.session.clone(),
                    start_byte: job.start,
                    end_byte: job.end,
                    read_buffer_size: self.config.read_buffer_size,
                    write_buffer_size: self.config.write_buffer_size,
                };
                spawn(chunk_run(ctx))
            })
            .collect();

        let mut all_finished = true;
        while let Some(joined) = tasks.next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    // 块的记录保持上次持久化的偏移，续传时重新下载
                    error!("[Downloader] 块任务异常退出: {e}");
                    all_finished = false;
                    continue;
                }
            };
            match report.state {
                Some(state) => {
                    all_finished &= state.status == ChunkStatus::Finished;
                    if let Some(slot) = self.record.chunks.get_mut(report.id) {
                        *slot = state;
                    }
                }
                None => all_finished = false,
            }
            if let Some(err) = report.error.filter(|e| !e.is_stop_signal()) {
                warn!("[Downloader] 块 {} 失败并被放弃: {err}", report.id);
                let _ = self.info_tx.send(DownloadInfo::ChunkFailed {
                    id,
                    chunk: report.id,
                    error: err.to_string(),
                });
                if self.config.abort_siblings_on_error {
                    warn!("[Downloader] 暂停其余块。");
                    self.session.pause.cancel();
                }
            }
        }

        debug!("[Downloader] 所有块任务已返回，全部完成: {all_finished}。");
        let _ = settled_tx.send(all_finished);
        let outcome = monitor_handle.await?;

        match outcome {
            Outcome::Finished => self.finish().await?,
            Outcome::Paused => self.persist_paused().await?,
            Outcome::Cancelled => self.discard().await?,
        }
        Ok(outcome)
    }

    async fn finish(&mut self) -> Result<()> {
        let id = self.record.id;
        let written = match self.record.total_size() {
            Some(total) => total,
            None => {
                let written = self.record.flushed_bytes();
                self.record.total_size = written as i64;
                written
            }
        };
        for chunk in &mut self.record.chunks {
            chunk.status = ChunkStatus::Finished;
        }
        self.record.status = DownloadStatus::Finished;
        self.record.downloaded = written as i64;
        self.record.touch();
        self.store.upsert(&self.record).await?;
        info!("[Downloader] 下载 {id} 完成: {}", self.record.file_path);
        let _ = self.info_tx.send(DownloadInfo::Finished { id });
        Ok(())
    }

    async fn persist_paused(&mut self) -> Result<()> {
        let id = self.record.id;
        for chunk in &mut self.record.chunks {
            if chunk.status == ChunkStatus::Active {
                chunk.status = ChunkStatus::Paused;
            }
        }
        self.record.status = DownloadStatus::Paused;
        self.record.downloaded = self.record.flushed_bytes() as i64;
        self.record.touch();
        self.store.upsert(&self.record).await?;
        info!(
            "[Downloader] 下载 {id} 已暂停，已保存 {} 字节的进度。",
            self.record.downloaded
        );
        let _ = self.info_tx.send(DownloadInfo::Paused { id });
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        let id = self.record.id;
        remove_file_if_exists(Path::new(&self.record.file_path)).await?;
        match self.store.remove(id).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!("[Downloader] 下载 {id} 已取消，文件与记录已删除。");
        let _ = self.info_tx.send(DownloadInfo::Removed { id });
        Ok(())
    }
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
