//! 直链解析器

use super::{skip_bytes, ByteStream, ResolvedSource, SourceResolver};
use crate::config::SourceRoute;
use crate::error::SourceError;
use crate::task::{
    extension_for_content_type, file_extension, sanitize_file_name, MediaKind, SourceDescriptor,
    FALLBACK_FILE_NAME,
};
use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("link-relay/", env!("CARGO_PKG_VERSION"));

/// 小于该大小的 HTML 响应视为错误页
const ERROR_PAGE_MAX_SIZE: u64 = 10_000;

/// HTTP(S) 直链解析器
///
/// 透传调用方提供的 Cookie / Authorization，支持 Range 续传
#[derive(Clone)]
pub struct HttpSourceResolver {
    name: String,
    client: Client,
}

impl HttpSourceResolver {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        Self::build("direct", HeaderMap::new(), connect_timeout)
    }

    /// 按平台路由配置创建，路由的请求头附加到每个请求上
    pub fn for_route(route: &SourceRoute, connect_timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &route.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("解析器 {} 的请求头名称无效: {}", route.name, name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("解析器 {} 的请求头 {} 取值无效", route.name, name))?;
            headers.insert(name, value);
        }
        Self::build(&route.name, headers, connect_timeout)
    }

    fn build(name: &str, headers: HeaderMap, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .cookie_store(true)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            name: name.to_string(),
            client,
        })
    }

    async fn open(
        &self,
        source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        let url = parse_http_url(&source.url)?;

        let mut request = self.client.get(url.clone());
        if let Some(cookie) = &source.cookie {
            request = request.header(header::COOKIE, cookie);
        }
        if let Some(auth) = &source.authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(source_error_from)?;
        let status = response.status();
        classify_status(status, &source.url)?;

        let headers = response.headers().clone();
        let partial = status == StatusCode::PARTIAL_CONTENT;
        let declared_size = if partial {
            content_range_total(&headers)
        } else {
            response.content_length()
        };

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if is_error_page(content_type, declared_size) {
            return Err(SourceError::Unresolvable(format!(
                "{} returned an error page instead of a file",
                source.url
            )));
        }

        let mut file_name = file_name_from_headers(&headers)
            .or_else(|| file_name_from_url(&url))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        if file_extension(&file_name).is_none() {
            if let Some(ext) = extension_for_content_type(content_type) {
                file_name = format!("{}.{}", file_name, ext);
            }
        }
        let media_kind = MediaKind::from_file_name(&file_name);

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io_kind_of(&e), e));
        let mut stream: ByteStream = Box::new(StreamReader::new(Box::pin(body)));

        if offset > 0 && !partial {
            debug!("服务器未响应 Range 请求，跳过前 {} 字节", offset);
            skip_bytes(&mut stream, offset).await?;
        }

        Ok(ResolvedSource {
            stream,
            declared_size,
            media_kind,
            file_name,
        })
    }
}

#[async_trait]
impl SourceResolver for HttpSourceResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, source: &SourceDescriptor) -> Result<ResolvedSource, SourceError> {
        let resolved = self.open(source, 0).await?;
        info!(
            "直链解析完成: {} -> {} ({:?} bytes)",
            source.url, resolved.file_name, resolved.declared_size
        );
        Ok(resolved)
    }

    async fn reopen(
        &self,
        source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        self.open(source, offset).await
    }
}

fn parse_http_url(raw: &str) -> Result<Url, SourceError> {
    let url = Url::parse(raw).map_err(|e| SourceError::Unresolvable(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SourceError::Unresolvable(format!(
            "unsupported scheme: {}",
            other
        ))),
    }
}

fn classify_status(status: StatusCode, url: &str) -> Result<(), SourceError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(SourceError::NotFound(format!("{} returned {}", url, status)))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(SourceError::Unavailable(format!("{} returned {}", url, status)))
        }
        s if s.is_server_error() => {
            Err(SourceError::Unavailable(format!("{} returned {}", url, status)))
        }
        s => Err(SourceError::Unresolvable(format!("{} returned {}", url, s))),
    }
}

fn io_kind_of(e: &reqwest::Error) -> io::ErrorKind {
    if e.is_timeout() {
        io::ErrorKind::TimedOut
    } else if e.is_connect() {
        io::ErrorKind::ConnectionRefused
    } else {
        io::ErrorKind::ConnectionReset
    }
}

fn source_error_from(e: reqwest::Error) -> SourceError {
    if e.is_builder() {
        return SourceError::Unresolvable(e.to_string());
    }
    SourceError::Io(io::Error::new(io_kind_of(&e), e))
}

/// 体积很小（或未声明大小）的 HTML 响应
fn is_error_page(content_type: &str, declared_size: Option<u64>) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
        && declared_size.map_or(true, |size| size < ERROR_PAGE_MAX_SIZE)
}

/// `Content-Range: bytes 100-199/1000` 中的总大小
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// 从 Content-Disposition 中提取文件名，优先 `filename*`
fn file_name_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;

    let extended = Regex::new(r#"(?i)filename\*\s*=\s*(?:[\w-]+'[^']*')?"?([^";]+)"?"#).ok()?;
    if let Some(caps) = extended.captures(value) {
        return Some(sanitize_file_name(caps[1].trim()));
    }

    let plain = Regex::new(r#"(?i)filename\s*=\s*"?([^";]+)"?"#).ok()?;
    plain
        .captures(value)
        .map(|caps| sanitize_file_name(caps[1].trim()))
}

/// URL 路径的最后一段
fn file_name_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(sanitize_file_name(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use reqwest::header::HeaderValue;
    use tokio::io::AsyncReadExt;

    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    async fn serve_file(headers: AxumHeaders) -> impl IntoResponse {
        let range_start = headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.trim_end_matches('-').parse::<usize>().ok());

        match range_start {
            Some(start) => (
                axum::http::StatusCode::PARTIAL_CONTENT,
                [(
                    "content-range",
                    format!("bytes {}-{}/{}", start, BODY.len() - 1, BODY.len()),
                )],
                BODY[start..].to_vec(),
            )
                .into_response(),
            None => (axum::http::StatusCode::OK, BODY.to_vec()).into_response(),
        }
    }

    async fn serve_status(Path(code): Path<u16>) -> impl IntoResponse {
        axum::http::StatusCode::from_u16(code).unwrap_or(axum::http::StatusCode::BAD_REQUEST)
    }

    async fn serve_named() -> impl IntoResponse {
        (
            [(
                "content-disposition",
                "attachment; filename=\"report final.pdf\"",
            )],
            b"%PDF".to_vec(),
        )
    }

    async fn serve_error_page() -> impl IntoResponse {
        axum::response::Html("<html><body>This link has expired</body></html>")
    }

    async fn serve_guarded(headers: AxumHeaders) -> impl IntoResponse {
        match headers.get("referer").and_then(|v| v.to_str().ok()) {
            Some("https://drive.example.com/") => (axum::http::StatusCode::OK, BODY.to_vec()),
            _ => (axum::http::StatusCode::FORBIDDEN, Vec::new()),
        }
    }

    async fn serve_typed_blob() -> impl IntoResponse {
        ([("content-type", "video/mp4")], BODY.to_vec())
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/expired", get(serve_error_page))
            .route("/blob", get(serve_typed_blob))
            .route("/guarded/file.bin", get(serve_guarded))
            .route("/files/video.mp4", get(serve_file))
            .route("/plain/data.bin", get(|| async { BODY.to_vec() }))
            .route("/status/:code", get(serve_status))
            .route("/download", get(serve_named));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn resolver() -> HttpSourceResolver {
        HttpSourceResolver::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_direct_link() {
        let base = spawn_server().await;
        let desc = SourceDescriptor::new(format!("{}/files/video.mp4", base));

        let mut resolved = resolver().resolve(&desc).await.unwrap();
        assert_eq!(resolved.declared_size, Some(BODY.len() as u64));
        assert_eq!(resolved.file_name, "video.mp4");
        assert_eq!(resolved.media_kind, MediaKind::Video);

        let mut data = Vec::new();
        resolved.stream.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, BODY);
    }

    #[tokio::test]
    async fn test_route_headers_are_sent() {
        let base = spawn_server().await;
        let desc = SourceDescriptor::new(format!("{}/guarded/file.bin", base));
        let route = SourceRoute {
            name: "drive".to_string(),
            hosts: vec!["drive.example.com".to_string()],
            headers: [("referer".to_string(), "https://drive.example.com/".to_string())]
                .into_iter()
                .collect(),
        };

        let routed = HttpSourceResolver::for_route(&route, Duration::from_secs(5)).unwrap();
        assert_eq!(routed.name(), "drive");
        let mut resolved = routed.resolve(&desc).await.unwrap();
        let mut data = Vec::new();
        resolved.stream.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, BODY);

        assert!(resolver().resolve(&desc).await.is_err());
    }

    #[test]
    fn test_route_with_invalid_header_is_rejected() {
        let route = SourceRoute {
            name: "broken".to_string(),
            hosts: vec!["broken.example".to_string()],
            headers: [("bad header".to_string(), "x".to_string())]
                .into_iter()
                .collect(),
        };
        assert!(HttpSourceResolver::for_route(&route, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn test_reopen_with_range() {
        let base = spawn_server().await;
        let desc = SourceDescriptor::new(format!("{}/files/video.mp4", base));

        let mut resolved = resolver().reopen(&desc, 10).await.unwrap();
        assert_eq!(resolved.declared_size, Some(BODY.len() as u64));

        let mut data = Vec::new();
        resolved.stream.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, &BODY[10..]);
    }

    #[tokio::test]
    async fn test_reopen_without_range_support_skips() {
        let base = spawn_server().await;
        let desc = SourceDescriptor::new(format!("{}/plain/data.bin", base));

        let mut resolved = resolver().reopen(&desc, 26).await.unwrap();
        let mut data = Vec::new();
        resolved.stream.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"qrstuvwxyz");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let base = spawn_server().await;
        let r = resolver();

        let err = r
            .resolve(&SourceDescriptor::new(format!("{}/status/404", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
        assert!(!err.is_transient());

        let err = r
            .resolve(&SourceDescriptor::new(format!("{}/status/503", base)))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let err = r
            .resolve(&SourceDescriptor::new(format!("{}/status/403", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unresolvable(_)));
    }

    #[tokio::test]
    async fn test_content_disposition_name() {
        let base = spawn_server().await;
        let resolved = resolver()
            .resolve(&SourceDescriptor::new(format!("{}/download", base)))
            .await
            .unwrap();
        assert_eq!(resolved.file_name, "report final.pdf");
        assert_eq!(resolved.media_kind, MediaKind::Pdf);
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let err = resolver()
            .resolve(&SourceDescriptor::new("ftp://example.com/a.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unresolvable(_)));
    }

    #[test]
    fn test_header_helpers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename*=UTF-8''na%C3%AFve%20clip.mkv"),
        );
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 100-199/1000"),
        );
        assert_eq!(
            file_name_from_headers(&headers).as_deref(),
            Some("naïve clip.mkv")
        );
        assert_eq!(content_range_total(&headers), Some(1000));

        let url = Url::parse("https://cdn.example.com/a/b/My%20Song.mp3?token=1").unwrap();
        assert_eq!(file_name_from_url(&url).as_deref(), Some("My Song.mp3"));

        let root = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(file_name_from_url(&root), None);
    }

    #[tokio::test]
    async fn test_small_html_response_is_unresolvable() {
        let base = spawn_server().await;
        let err = resolver()
            .resolve(&SourceDescriptor::new(format!("{}/expired", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unresolvable(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_extension_from_content_type() {
        let base = spawn_server().await;
        let resolved = resolver()
            .resolve(&SourceDescriptor::new(format!("{}/blob", base)))
            .await
            .unwrap();
        assert_eq!(resolved.file_name, "blob.mp4");
        assert_eq!(resolved.media_kind, MediaKind::Video);
    }

    #[test]
    fn test_error_page_detection() {
        assert!(is_error_page("text/html; charset=utf-8", Some(512)));
        assert!(is_error_page("TEXT/HTML", None));
        assert!(!is_error_page("text/html", Some(50_000)));
        assert!(!is_error_page("video/mp4", Some(512)));
    }
}
