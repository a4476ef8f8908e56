//! 下载监控器：周期性采样进度，判定会话的最终结果，并负责关闭输出文件。

use crate::file::OutputFile;
use crate::state::SessionState;
use crate::types::{DownloadInfo, Outcome};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{MissedTickBehavior, interval};

/// 每个会话一个的进度监控器。
///
/// 它是唯一可以关闭输出文件的地方，并且每个会话只报告一个结果。
pub(crate) struct ProgressMonitor {
    session: SessionState,
    file: Arc<OutputFile>,
    info_tx: broadcast::Sender<DownloadInfo>,
    update_interval: Duration,
    /// 所有分片任务返回后，控制器发送“是否全部分片都已完成”
    settled_rx: oneshot::Receiver<bool>,
    last_sample: u64,
}

impl ProgressMonitor {
    pub fn new(
        session: SessionState,
        file: Arc<OutputFile>,
        info_tx: broadcast::Sender<DownloadInfo>,
        update_interval: Duration,
        settled_rx: oneshot::Receiver<bool>,
    ) -> Self {
        let last_sample = session.downloaded();
        Self {
            session,
            file,
            info_tx,
            update_interval,
            settled_rx,
            last_sample,
        }
    }

    /// 运行监控器的主循环，直到得出会话结果。
    pub async fn run(mut self) -> Outcome {
        let id = self.session.id;
        info!("[Monitor {id}] 监控器正在运行，采样间隔 {:?}。", self.update_interval);
        let mut ticker = interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick_time = Instant::now();

        let outcome = loop {
            tokio::select! {
                // `biased` 保证取消优先于暂停，暂停优先于完成
                biased;

                _ = self.session.cancel.cancelled() => {
                    info!("[Monitor {id}] 检测到取消信号。");
                    self.wait_settled().await;
                    break Outcome::Cancelled;
                }

                _ = self.session.pause.cancelled() => {
                    info!("[Monitor {id}] 检测到暂停信号。");
                    let all_finished = self.wait_settled().await;
                    // 暂停到达时所有分片可能已经写完
                    if self.is_finished(all_finished) {
                        self.sample(last_tick_time.elapsed());
                        info!("[Monitor {id}] 所有分片已在暂停前完成。");
                        break Outcome::Finished;
                    }
                    break Outcome::Paused;
                }

                settled = &mut self.settled_rx => {
                    let all_finished = settled.unwrap_or(false);
                    self.sample(last_tick_time.elapsed());
                    if self.is_finished(all_finished) {
                        info!("[Monitor {id}] 所有分片已完成。");
                        break Outcome::Finished;
                    }
                    warn!(
                        "[Monitor {id}] 分片任务已全部返回但下载未完成 ({} / {:?})，按暂停处理。",
                        self.session.downloaded(),
                        self.session.total_size
                    );
                    break Outcome::Paused;
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = now - last_tick_time;
                    last_tick_time = now;
                    trace!("[Monitor {id}] 定时器触发，距上次 {:.3}s。", elapsed.as_secs_f64());
                    self.sample(elapsed);
                    if self.session.is_complete() {
                        debug!("[Monitor {id}] 已接收全部字节，等待分片刷写。");
                    }
                }
            }
        };

        // 整个会话只在这里关闭文件
        match self.file.close().await {
            Ok(true) => {}
            Ok(false) => warn!("[Monitor {id}] 输出文件已经被关闭。"),
            Err(e) => error!("[Monitor {id}] 关闭文件失败: {e}"),
        }
        info!("[Monitor {id}] 会话结束，结果: {outcome:?}。");
        outcome
    }

    /// 停止信号已发出，等所有分片刷写完毕后才能关闭文件。
    async fn wait_settled(&mut self) -> bool {
        match (&mut self.settled_rx).await {
            Ok(all_finished) => all_finished,
            Err(e) => {
                warn!("[Monitor {}] 控制器在分片结束前退出: {e}", self.session.id);
                false
            }
        }
    }

    fn is_finished(&self, all_finished: bool) -> bool {
        all_finished && (self.session.total_size.is_none() || self.session.is_complete())
    }

    /// 读取计数器，计算进度与速度并推送给订阅者。
    fn sample(&mut self, elapsed: Duration) {
        let downloaded = self.session.downloaded();
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            downloaded.saturating_sub(self.last_sample) as f64 / secs
        } else {
            0.0
        };
        self.last_sample = downloaded;
        let fraction = self.session.fraction();
        debug!(
            "[Monitor {}] 进度 {:.2}%，速度 {:.2} B/s",
            self.session.id,
            fraction * 100.0,
            speed
        );
        let _ = self.info_tx.send(DownloadInfo::Progress {
            id: self.session.id,
            fraction,
            speed,
            downloaded,
            total: self.session.total_size,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    type Fixture = (
        tempfile::TempDir,
        Arc<OutputFile>,
        SessionState,
        broadcast::Receiver<DownloadInfo>,
        broadcast::Sender<DownloadInfo>,
    );

    async fn setup(total: Option<u64>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(OutputFile::create(dir.path().join("f"), total).await.unwrap());
        let session = SessionState::new(Uuid::new_v4(), total, 0);
        let (tx, rx) = broadcast::channel(64);
        (dir, file, session, rx, tx)
    }

    #[tokio::test]
    async fn finishes_once_settled_and_complete() {
        let (_dir, file, session, mut rx, tx) = setup(Some(10)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file.clone(),
            tx,
            Duration::from_millis(10),
            settled_rx,
        );
        let handle = tokio::spawn(monitor.run());

        session.add_downloaded(10);
        settled_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Outcome::Finished);
        assert!(file.is_closed().await);

        let mut last_fraction = 0.0;
        while let Ok(DownloadInfo::Progress { fraction, .. }) = rx.try_recv() {
            last_fraction = fraction;
        }
        assert_eq!(last_fraction, 1.0);
    }

    #[tokio::test]
    async fn incomplete_settle_is_paused() {
        let (_dir, file, session, _rx, tx) = setup(Some(10)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file,
            tx,
            Duration::from_millis(10),
            settled_rx,
        );
        let handle = tokio::spawn(monitor.run());

        session.add_downloaded(4);
        settled_tx.send(false).unwrap();
        assert_eq!(handle.await.unwrap(), Outcome::Paused);
    }

    #[tokio::test]
    async fn cancel_wins_over_pause_and_waits_for_settle() {
        let (_dir, file, session, _rx, tx) = setup(Some(10)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file.clone(),
            tx,
            Duration::from_millis(10),
            settled_rx,
        );

        session.pause.cancel();
        session.cancel.cancel();
        let handle = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!file.is_closed().await, "分片结束前不能关闭文件");

        settled_tx.send(false).unwrap();
        assert_eq!(handle.await.unwrap(), Outcome::Cancelled);
        assert!(file.is_closed().await);
    }

    #[tokio::test]
    async fn pause_after_all_chunks_finished_is_finished() {
        let (_dir, file, session, _rx, tx) = setup(Some(10)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file.clone(),
            tx,
            Duration::from_secs(60),
            settled_rx,
        );

        session.add_downloaded(10);
        session.pause.cancel();
        settled_tx.send(true).unwrap();

        assert_eq!(monitor.run().await, Outcome::Finished);
        assert!(file.is_closed().await);
    }

    #[tokio::test]
    async fn pause_with_unfinished_chunks_is_paused() {
        let (_dir, file, session, _rx, tx) = setup(Some(10)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file,
            tx,
            Duration::from_secs(60),
            settled_rx,
        );

        session.add_downloaded(10);
        session.pause.cancel();
        settled_tx.send(false).unwrap();

        assert_eq!(monitor.run().await, Outcome::Paused);
    }

    #[tokio::test]
    async fn reports_throughput() {
        let (_dir, file, session, mut rx, tx) = setup(Some(1000)).await;
        let (settled_tx, settled_rx) = oneshot::channel();
        let monitor = ProgressMonitor::new(
            session.clone(),
            file,
            tx,
            Duration::from_millis(20),
            settled_rx,
        );
        let handle = tokio::spawn(monitor.run());

        session.add_downloaded(500);
        let mut seen_speed = false;
        while let Ok(info) = rx.recv().await {
            if let DownloadInfo::Progress { speed, fraction, .. } = info {
                if speed > 0.0 {
                    assert_eq!(fraction, 0.5);
                    seen_speed = true;
                    break;
                }
            }
        }
        assert!(seen_speed);

        session.pause.cancel();
        settled_tx.send(false).unwrap();
        assert_eq!(handle.await.unwrap(), Outcome::Paused);
    }
}
