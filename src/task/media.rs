//! 媒体类型识别与文件名清理

use serde::{Deserialize, Serialize};

/// 文件名最大长度（含扩展名）
const MAX_FILE_NAME_LEN: usize = 200;

/// 文件名兜底值
pub const FALLBACK_FILE_NAME: &str = "downloaded_file";

/// 识别文件类型时读取的文件头长度
pub const SNIFF_LEN: usize = 32;

/// 媒体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    /// PDF 文档
    Pdf,
    /// Android 安装包
    Apk,
    /// 压缩包
    Archive,
    /// 其他文件
    Document,
}

impl MediaKind {
    /// 根据扩展名（不含点，大小写不敏感）判断媒体类型
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "3gp" | "mpeg"
            | "mpg" | "ts" => MediaKind::Video,
            "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" | "opus" | "amr" => {
                MediaKind::Audio
            }
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff" | "ico" => MediaKind::Image,
            "pdf" => MediaKind::Pdf,
            "apk" => MediaKind::Apk,
            "zip" | "rar" | "7z" | "tar" | "gz" => MediaKind::Archive,
            _ => MediaKind::Document,
        }
    }

    /// 根据文件名判断媒体类型
    pub fn from_file_name(name: &str) -> Self {
        file_extension(name)
            .map(Self::from_extension)
            .unwrap_or(MediaKind::Document)
    }

    /// 是否尝试生成缩略图
    pub fn supports_thumbnail(&self) -> bool {
        matches!(
            self,
            MediaKind::Video
                | MediaKind::Audio
                | MediaKind::Image
                | MediaKind::Pdf
                | MediaKind::Apk
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
            MediaKind::Pdf => "pdf",
            MediaKind::Apk => "apk",
            MediaKind::Archive => "archive",
            MediaKind::Document => "document",
        }
    }
}

/// 提取扩展名（不含点）
///
/// 超过 5 个字符的"扩展名"视为文件名的一部分
pub fn file_extension(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext)
}

/// Content-Type 对应的扩展名（忽略参数，大小写不敏感）
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "video/mp4" => "mp4",
        "video/x-matroska" => "mkv",
        "video/webm" => "webm",
        "video/avi" | "video/x-msvideo" => "avi",
        "video/quicktime" => "mov",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/flac" => "flac",
        "audio/ogg" => "ogg",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/vnd.android.package-archive" => "apk",
        _ => return None,
    };
    Some(ext)
}

/// 按文件头识别扩展名
///
/// 返回 `"html"` 表示拿到的是网页而不是文件
pub fn detect_extension(header: &[u8]) -> Option<&'static str> {
    let h = header;
    let ext = if h.len() >= 12 && h[4..12].windows(4).any(|w| w == b"ftyp") {
        "mp4"
    } else if h.starts_with(b"\x1a\x45\xdf\xa3") {
        "mkv"
    } else if is_riff(h, b"AVI ") {
        "avi"
    } else if is_riff(h, b"WAVE") {
        "wav"
    } else if is_riff(h, b"WEBP") {
        "webp"
    } else if h.starts_with(b"FLV") {
        "flv"
    } else if h.starts_with(b"ID3") || h.starts_with(b"\xff\xfb") || h.starts_with(b"\xff\xfa") {
        "mp3"
    } else if h.starts_with(b"fLaC") {
        "flac"
    } else if h.starts_with(b"OggS") {
        "ogg"
    } else if h.starts_with(b"\xff\xd8") {
        "jpg"
    } else if h.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if h.starts_with(b"GIF87a") || h.starts_with(b"GIF89a") {
        "gif"
    } else if h.starts_with(b"%PDF") {
        "pdf"
    } else if h.starts_with(b"PK\x03\x04") {
        "zip"
    } else if h.starts_with(b"Rar!\x1a\x07") {
        "rar"
    } else if looks_like_html(h) {
        "html"
    } else {
        return None;
    };
    Some(ext)
}

fn is_riff(header: &[u8], kind: &[u8]) -> bool {
    header.starts_with(b"RIFF") && header.get(8..12) == Some(kind)
}

fn looks_like_html(header: &[u8]) -> bool {
    let lower = header.to_ascii_lowercase();
    [b"<!doctype".as_slice(), b"<html".as_slice()]
        .iter()
        .any(|tag| lower.windows(tag.len()).any(|w| w == *tag))
}

/// 按识别出的类型修正文件名
///
/// - 没有扩展名时补上
/// - 扩展名对应的媒体类型与内容不符时替换
/// - zip 容器（apk、docx 等）保留原扩展名
///
/// 不需要修改时返回 `None`
pub fn corrected_file_name(name: &str, detected: &str) -> Option<String> {
    if detected == "html" {
        return None;
    }
    match file_extension(name) {
        None => Some(format!("{}.{}", name, detected)),
        Some(ext) if ext.eq_ignore_ascii_case(detected) => None,
        Some(_) if detected == "zip" => None,
        Some(ext) => {
            if MediaKind::from_extension(ext) == MediaKind::from_extension(detected) {
                return None;
            }
            let stem = &name[..name.len() - ext.len() - 1];
            Some(format!("{}.{}", stem, detected))
        }
    }
}

/// 清理文件名
///
/// - URL 解码
/// - 替换路径分隔符和控制字符
/// - 去除首尾的点和空白
/// - 超长时截断主文件名，保留扩展名
pub fn sanitize_file_name(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let replaced: String = decoded
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return FALLBACK_FILE_NAME.to_string();
    }

    if trimmed.chars().count() <= MAX_FILE_NAME_LEN {
        return trimmed.to_string();
    }

    match file_extension(trimmed) {
        Some(ext) => {
            let keep = MAX_FILE_NAME_LEN - ext.chars().count() - 1;
            let stem: String = trimmed.chars().take(keep).collect();
            format!("{}.{}", stem, ext)
        }
        None => trimmed.chars().take(MAX_FILE_NAME_LEN).collect(),
    }
}
