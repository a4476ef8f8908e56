// file.rs
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace};
use tokio::sync::RwLock;
use tokio::task::spawn_blocking;

use crate::types::FetchError;

/// 同一会话所有分片共享的输出文件。
///
/// 写入使用带偏移的定位写，不共享文件游标；各分片的范围互不重叠。
/// 只有监控器调用 `close`，关闭会等待进行中的写入结束，之后的写入返回
/// `FetchError::FileClosed`。
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    inner: RwLock<Option<Arc<File>>>,
}

impl OutputFile {
    /// 创建（或截断）输出文件，大小已知时预分配。父目录不存在时自动创建。
    pub async fn create(path: impl Into<PathBuf>, size: Option<u64>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = {
            let path = path.clone();
            spawn_blocking(move || -> io::Result<File> {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                if let Some(size) = size {
                    file.set_len(size)?;
                }
                Ok(file)
            })
            .await
            .map_err(io::Error::other)??
        };
        debug!("[OutputFile] 已创建 {}，预分配 {size:?} 字节。", path.display());
        Ok(Self::from_file(path, file))
    }

    /// 以读写方式打开已有文件用于续传，不截断。
    pub async fn open_existing(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = {
            let path = path.clone();
            spawn_blocking(move || {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
            })
            .await
            .map_err(io::Error::other)??
        };
        debug!("[OutputFile] 已重新打开 {}。", path.display());
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            inner: RwLock::new(Some(Arc::new(file))),
        }
    }

    /// 在 `offset` 处写入全部数据。
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), FetchError> {
        let guard = self.inner.read().await;
        let file = guard.as_ref().ok_or(FetchError::FileClosed)?.clone();
        let len = data.len();
        spawn_blocking(move || write_all_at(&file, &data, offset))
            .await
            .map_err(io::Error::other)??;
        trace!("[OutputFile] 已写入 {len} 字节，偏移 {offset}。");
        Ok(())
    }

    /// 关闭文件。仅第一次调用真正关闭并返回 `true`。
    pub async fn close(&self) -> io::Result<bool> {
        let mut guard = self.inner.write().await;
        let Some(file) = guard.take() else {
            return Ok(false);
        };
        spawn_blocking(move || file.sync_all())
            .await
            .map_err(io::Error::other)??;
        info!("[OutputFile] {} 已关闭。", self.path.display());
        Ok(true)
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.is_none()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
