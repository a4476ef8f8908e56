//! 提供工具函数，如定位下载目录、解析文件名和清理文件名。

use log::trace;
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use url::Url;

/// 无法从响应头和 URL 推断文件名时使用的名字。
pub const FALLBACK_FILE_NAME: &str = "unknown_file";

/// 默认下载目录：`~/Downloads/DownBitDownloads`。
pub fn default_download_dir() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join("Downloads").join("DownBitDownloads"))
}

/// 默认状态文件：`~/DownBit/database/downloads.json`。
pub fn default_store_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join("DownBit").join("database").join("downloads.json"))
}

/// 从 `Content-Disposition` 头中提取 `filename` 参数。
///
/// 同时支持 `filename*=UTF-8''...` 与 `filename="..."` 两种写法，前者优先。
pub(crate) fn filename_from_disposition(disposition: &str) -> Option<String> {
    let params = disposition.split(';').skip(1).map(str::trim);
    let mut plain = None;
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // RFC 5987: charset'lang'percent-encoded
                let encoded = value.trim().rsplit("''").next().unwrap_or_default();
                let decoded = percent_decode(encoded.trim_matches('"'));
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            "filename" => {
                let name = value.trim().trim_matches('"');
                if !name.is_empty() {
                    plain = Some(name.to_string());
                }
            }
            _ => {}
        }
    }
    plain
}

/// 取 URL 路径的最后一段作为文件名。
pub(crate) fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let name = percent_decode(last);
    if name.is_empty() || name == "/" {
        None
    } else {
        Some(name)
    }
}

/// 清理文件名，使其可以安全地落盘。
///
/// 去掉双引号，把路径分隔符和通配符替换为 `_`，并把形如
/// `my.movie.720p.ir.mp4` 的多段扩展名压缩为 `my_movie_720p.ir.mp4`：
/// 最后一个扩展名之前至多保留一个标签段。
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    let parts: Vec<&str> = trimmed.split('.').collect();
    let collapsed = if parts.len() > 3 {
        let stem = parts[..parts.len() - 2].join("_");
        format!("{stem}.{}.{}", parts[parts.len() - 2], parts[parts.len() - 1])
    } else {
        trimmed.to_string()
    };

    let cleaned: String = collapsed
        .chars()
        .filter(|c| *c != '"')
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    trace!("文件名清理: {name:?} -> {cleaned:?}");

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

/// 解码 `%XX` 转义；非法序列按原样保留，非 UTF-8 字节替换为 U+FFFD。
fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("a/b\\c:d*e?f<g>h|i.txt"), "a_b_c_d_e_f_g_h_i.txt");
        assert_eq!(sanitize_file_name("\"quoted.zip\""), "quoted.zip");
        assert_eq!(sanitize_file_name("  spaced.bin "), "spaced.bin");
    }

    #[test]
    fn sanitize_collapses_intermediate_extensions() {
        assert_eq!(sanitize_file_name("movie.ir.mp4"), "movie.ir.mp4");
        assert_eq!(sanitize_file_name("archive.tar.gz"), "archive.tar.gz");
        assert_eq!(sanitize_file_name("my.movie.720p.ir.mp4"), "my_movie_720p.ir.mp4");
        assert_eq!(sanitize_file_name("plain"), "plain");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("\"\""), FALLBACK_FILE_NAME);
    }

    #[test]
    fn disposition_filename() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=plain.txt; size=3").as_deref(),
            Some("plain.txt")
        );
        assert_eq!(
            filename_from_disposition(
                r#"attachment; filename="fallback.txt"; filename*=UTF-8''na%C3%AFve%20file.txt"#
            )
            .as_deref(),
            Some("naïve file.txt")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn percent_escapes() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("bad%zzhex"), "bad%zzhex");
        assert_eq!(percent_decode("%E4%B8%AD.txt"), "中.txt");
    }

    #[test]
    fn url_filename() {
        assert_eq!(
            filename_from_url("https://example.com/files/big%20file.iso?x=1").as_deref(),
            Some("big file.iso")
        );
        assert_eq!(filename_from_url("https://example.com/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }
}
