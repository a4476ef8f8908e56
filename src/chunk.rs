//! 定义和管理单个下载块（chunk）的执行逻辑。

use crate::file::OutputFile;
use crate::state::{ChunkState, ChunkStatus, SessionState};
use crate::types::{ChunkId, FetchError};
use bytes::BytesMut;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use reqwest::header::RANGE;
use reqwest::{RequestBuilder, StatusCode};
use std::sync::Arc;

/// 单个块任务的输入。
pub(crate) struct ChunkContext {
    pub id: ChunkId,
    pub req_builder: RequestBuilder,
    pub file: Arc<OutputFile>,
    pub session: SessionState,
    /// 本次要下载的起始字节
    pub start_byte: u64,
    /// 结束字节（闭区间），大小未知时为 `None`
    pub end_byte: Option<u64>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

/// 块任务的结果。
///
/// 暂停、出错或正常结束时 `state` 记录最后一次刷写后的偏移；取消时为 `None`。
#[derive(Debug)]
pub(crate) struct ChunkReport {
    pub id: ChunkId,
    pub state: Option<ChunkState>,
    pub error: Option<FetchError>,
}

/// 块内的下载进度：`offset` 之前的字节都已写入文件。
struct ChunkCursor {
    id: ChunkId,
    end: Option<u64>,
    offset: u64,
    buffer: BytesMut,
}

impl ChunkCursor {
    /// 把合并缓冲区写到文件，成功后推进 `offset`。
    async fn flush(&mut self, file: &OutputFile) -> Result<(), FetchError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = self.buffer.split().freeze();
        let len = data.len() as u64;
        file.write_at(self.offset, data).await?;
        self.offset += len;
        trace!("[Chunk {}] 已刷写 {len} 字节，偏移推进到 {}。", self.id, self.offset);
        Ok(())
    }

    fn state(&self, status: ChunkStatus) -> ChunkState {
        ChunkState {
            end: self.end.map_or(-1, |e| e as i64),
            current_offset: self.offset as i64,
            status,
        }
    }

    /// 正常结束时的状态：范围写满为 `Finished`，否则可续传。
    fn settled_state(&self) -> ChunkState {
        match self.end {
            Some(end) if self.offset <= end => self.state(ChunkStatus::Paused),
            _ => self.state(ChunkStatus::Finished),
        }
    }

    fn report(&self, status: ChunkStatus, error: Option<FetchError>) -> ChunkReport {
        ChunkReport {
            id: self.id,
            state: Some(self.state(status)),
            error,
        }
    }
}

/// 单个下载块的执行任务。
///
/// 发送范围请求，把响应流写入输出文件的对应位置。每次读到数据后先累加
/// 会话计数器，再放入合并缓冲区，缓冲区达到阈值或流结束时刷写。
/// 每次读取前都会检查暂停和取消信号：暂停时先刷写缓冲区再返回，
/// 保证记录的偏移与文件内容一致；取消时直接返回，文件会被删除。
pub(crate) async fn chunk_run(ctx: ChunkContext) -> ChunkReport {
    let ChunkContext {
        id,
        req_builder,
        file,
        session,
        start_byte,
        end_byte,
        read_buffer_size,
        write_buffer_size,
    } = ctx;

    let mut cursor = ChunkCursor {
        id,
        end: end_byte,
        offset: start_byte,
        buffer: BytesMut::with_capacity(write_buffer_size),
    };
    info!("[Chunk {id}] 开始执行，范围: {start_byte}-{end_byte:?}。");

    // 构建 Range 请求头；大小未知且从头开始时不带 Range
    let req_builder = match end_byte {
        Some(end) => req_builder.header(RANGE, format!("bytes={start_byte}-{end}")),
        None if start_byte > 0 => req_builder.header(RANGE, format!("bytes={start_byte}-")),
        None => req_builder,
    };

    let sent = tokio::select! {
        biased;
        _ = session.cancel.cancelled() => {
            info!("[Chunk {id}] 请求发出前收到取消信号。");
            return ChunkReport {
                id,
                state: None,
                error: Some(FetchError::Canceled),
            };
        }
        _ = session.pause.cancelled() => {
            info!("[Chunk {id}] 请求发出前收到暂停信号。");
            return cursor.report(ChunkStatus::Paused, Some(FetchError::Canceled));
        }
        resp = req_builder.send() => resp.and_then(|r| r.error_for_status()),
    };
    let response = match sent {
        Ok(resp) => resp,
        Err(e) => {
            error!("[Chunk {id}] 请求失败: {e}");
            return cursor.report(ChunkStatus::Paused, Some(e.into()));
        }
    };
    if start_byte > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
        error!("[Chunk {id}] 服务器返回 {}，未遵守范围请求。", response.status());
        let err = FetchError::RangeIgnored { start: start_byte };
        return cursor.report(ChunkStatus::Paused, Some(err));
    }
    debug!("[Chunk {id}] 请求成功，状态码 {}。", response.status());

    // 本块还允许读取的字节数
    let mut allowed = end_byte.map(|end| end + 1 - start_byte);
    let mut stream = response.bytes_stream();

    loop {
        if allowed == Some(0) {
            debug!("[Chunk {id}] 已读满范围。");
            break;
        }
        tokio::select! {
            // `biased` 确保优先处理停止信号
            biased;

            _ = session.cancel.cancelled() => {
                info!("[Chunk {id}] 收到取消信号，丢弃未写入的数据。");
                return ChunkReport {
                    id,
                    state: None,
                    error: Some(FetchError::Canceled),
                };
            }

            _ = session.pause.cancelled() => {
                info!("[Chunk {id}] 收到暂停信号，刷写缓冲区后退出。");
                return match cursor.flush(&file).await {
                    Ok(()) => cursor.report(ChunkStatus::Paused, Some(FetchError::Canceled)),
                    Err(e) => {
                        warn!("[Chunk {id}] 暂停时刷写失败: {e}");
                        cursor.report(ChunkStatus::Paused, Some(e))
                    }
                };
            }

            next = stream.next() => match next {
                Some(Ok(mut bytes)) => {
                    // 服务器多给的数据不属于本块
                    if let Some(left) = allowed {
                        if bytes.len() as u64 > left {
                            trace!("[Chunk {id}] 数据超出范围，截断为 {left} 字节。");
                            bytes.truncate(left as usize);
                        }
                    }
                    while !bytes.is_empty() {
                        let piece = bytes.split_to(bytes.len().min(read_buffer_size));
                        let n = piece.len() as u64;
                        session.add_downloaded(n);
                        allowed = allowed.map(|left| left - n);
                        cursor.buffer.extend_from_slice(&piece);

                        if cursor.buffer.len() >= write_buffer_size {
                            if let Err(e) = cursor.flush(&file).await {
                                error!("[Chunk {id}] 写入文件失败: {e}");
                                return cursor.report(ChunkStatus::Paused, Some(e));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("[Chunk {id}] 下载流错误: {e}");
                    // 已收到的数据仍然有效，先落盘再报告失败
                    if let Err(flush_err) = cursor.flush(&file).await {
                        warn!("[Chunk {id}] 流错误后刷写失败: {flush_err}");
                    }
                    return cursor.report(ChunkStatus::Paused, Some(e.into()));
                }
                None => {
                    debug!("[Chunk {id}] 下载流已结束。");
                    break;
                }
            },
        }
    }

    if let Err(e) = cursor.flush(&file).await {
        error!("[Chunk {id}] 写入剩余数据失败: {e}");
        return cursor.report(ChunkStatus::Paused, Some(e));
    }

    let state = cursor.settled_state();
    if state.status == ChunkStatus::Finished {
        info!("[Chunk {id}] 下载成功完成，共写入 {} 字节。", cursor.offset - start_byte);
    } else {
        warn!(
            "[Chunk {id}] 流提前结束，已写到 {}，范围结束于 {end_byte:?}。",
            cursor.offset
        );
    }
    ChunkReport {
        id,
        state: Some(state),
        error: None,
    }
}
