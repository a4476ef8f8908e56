//! 远程资源探测：获取文件大小、推断文件名并计算保存路径。

use crate::types::ProbeError;
use crate::util::{
    FALLBACK_FILE_NAME, filename_from_disposition, filename_from_url, sanitize_file_name,
};
use log::{debug, info, warn};
use reqwest::Client;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, HeaderMap};
use std::path::{Path, PathBuf};

/// 一次探测的结果，之后不再改变。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// 清理后的文件名。
    pub name: String,
    /// 文件总大小，服务器没有给出时为 `None`。
    pub total_size: Option<u64>,
    /// 文件的保存路径：下载目录 + 文件名。
    pub file_path: PathBuf,
    pub url: String,
    /// 服务器是否声明支持 `Accept-Ranges: bytes`。
    pub accept_ranges: bool,
}

impl ResourceDescriptor {
    /// 以 `-1` 表示未知大小，与持久化格式一致。
    pub fn total_size_i64(&self) -> i64 {
        self.total_size.map_or(-1, |size| size as i64)
    }
}

/// 以 HEAD 请求探测资源。只读，没有副作用。
pub async fn probe(
    client: &Client,
    url: &str,
    download_dir: &Path,
) -> Result<ResourceDescriptor, ProbeError> {
    info!("探测资源: {url}");

    let resp = client.head(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        warn!("探测失败，服务器返回 {status}");
        return Err(ProbeError::BadStatus(status));
    }

    let headers = resp.headers();
    let total_size = content_length(headers);
    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"bytes"));
    let name = file_name(headers, url);
    let file_path = download_dir.join(&name);

    debug!(
        "探测结果: name={name}, size={total_size:?}, accept_ranges={accept_ranges}, path={}",
        file_path.display()
    );

    Ok(ResourceDescriptor {
        name,
        total_size,
        file_path,
        url: url.to_string(),
        accept_ranges,
    })
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// 依次尝试 `Content-Disposition`、URL 最后一段，最后退回 `unknown_file`。
fn file_name(headers: &HeaderMap, url: &str) -> String {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .or_else(|| filename_from_url(url))
        .map(|name| sanitize_file_name(&name))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}
