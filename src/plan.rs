//! 分块计划：根据文件大小决定块数，并计算每个块的字节范围。

use crate::state::{ChunkState, ChunkStatus};
use crate::types::PlanError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// 一个块的字节范围，`end` 为闭区间。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// 按文件大小分档决定块数。
pub fn chunk_count(total_size: u64) -> u64 {
    match total_size {
        s if s <= 10 * MIB => 1,
        s if s <= 100 * MIB => 5,
        s if s <= GIB => 8,
        _ => 15,
    }
}

/// 计算完整下载的分块计划。
///
/// 前 `n-1` 个块大小为 `total_size / n`，最后一个块吸收整除的余数，
/// 所有范围首尾相接且恰好覆盖 `[0, total_size-1]`。空文件返回空计划。
pub fn plan(total_size: u64) -> Vec<ChunkRange> {
    // chunk_count 永远不为 0
    split(total_size, chunk_count(total_size)).unwrap_or_default()
}

/// 把 `[0, total_size-1]` 均分成 `n` 块。
pub fn split(total_size: u64, n: u64) -> Result<Vec<ChunkRange>, PlanError> {
    if n == 0 {
        return Err(PlanError::ZeroChunks);
    }
    if total_size == 0 {
        return Ok(Vec::new());
    }
    // 文件比块数还小时，每块至少一个字节
    let n = n.min(total_size);
    let chunk_size = total_size / n;
    Ok((0..n)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i == n - 1 { total_size - 1 } else { (i + 1) * chunk_size - 1 };
            ChunkRange { start, end }
        })
        .collect())
}

/// 从持久化的块状态恢复出需要续传的范围 `[current_offset, end]`。
///
/// 返回值与 `chunks` 一一对应，已完成的块为 `None`。
/// 大小未知的块（`end < 0`）不在此处理。
pub fn resume_ranges(chunks: &[ChunkState]) -> Vec<Option<ChunkRange>> {
    chunks
        .iter()
        .map(|c| {
            if c.status == ChunkStatus::Finished || c.end < 0 || c.current_offset > c.end {
                None
            } else {
                Some(ChunkRange {
                    start: c.current_offset.max(0) as u64,
                    end: c.end as u64,
                })
            }
        })
        .collect()
}
