//! 缩略图生成
//!
//! 所有失败（文件损坏、解码失败、外部工具缺失或超时）都返回 None，
//! 不影响任务投递

use crate::config::ThumbnailConfig;
use crate::task::MediaKind;
use anyhow::{anyhow, bail, Context, Result};
use image::ImageFormat;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 缩略图生成器
#[derive(Debug, Clone)]
pub struct ThumbnailGenerator {
    config: ThumbnailConfig,
}

impl ThumbnailGenerator {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    /// 缩略图输出路径：`<artifact>_thumb.jpg`
    pub fn output_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push("_thumb.jpg");
        PathBuf::from(name)
    }

    /// 为产物生成缩略图
    pub async fn generate(&self, artifact: &Path, kind: MediaKind) -> Option<PathBuf> {
        if !self.config.enabled || !kind.supports_thumbnail() {
            return None;
        }

        let output = Self::output_path(artifact);
        let result = match kind {
            MediaKind::Video => self.from_video(artifact, &output).await,
            MediaKind::Audio => self.from_audio(artifact, &output).await,
            MediaKind::Image => self.from_image(artifact, &output).await,
            MediaKind::Pdf => self.from_pdf(artifact, &output).await,
            MediaKind::Apk => self.from_apk(artifact, &output).await,
            _ => return None,
        };

        match result {
            Ok(()) if is_non_empty_file(&output).await => {
                info!("缩略图已生成: {:?}", output);
                Some(output)
            }
            Ok(()) => {
                debug!("缩略图工具未产生输出: {:?}", artifact);
                discard(&output).await;
                None
            }
            Err(e) => {
                warn!("缩略图生成失败 ({}): {:?}, {:#}", kind.as_str(), artifact, e);
                discard(&output).await;
                None
            }
        }
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool_timeout_secs.max(1))
    }

    async fn run_tool(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.tool_timeout(), command.status())
            .await
            .map_err(|_| anyhow!("{} 超时", program))?
            .with_context(|| format!("无法启动 {}", program))?;

        if !status.success() {
            bail!("{} 退出码异常: {}", program, status);
        }
        Ok(())
    }

    async fn from_video(&self, artifact: &Path, output: &Path) -> Result<()> {
        let scale = format!(
            "scale={d}:{d}:force_original_aspect_ratio=decrease",
            d = self.config.max_dimension
        );
        let input = path_str(artifact)?;
        let out = path_str(output)?;
        self.run_tool(
            &self.config.ffmpeg_path,
            &["-ss", "1", "-i", input, "-vframes", "1", "-vf", scale.as_str(), "-y", out],
        )
        .await
    }

    /// 导出音频内嵌的专辑封面
    async fn from_audio(&self, artifact: &Path, output: &Path) -> Result<()> {
        let args = cover_art_args(path_str(artifact)?, path_str(output)?);
        self.run_tool(&self.config.ffmpeg_path, &args).await
    }

    async fn from_pdf(&self, artifact: &Path, output: &Path) -> Result<()> {
        // pdftoppm 会在前缀后追加 .jpg
        let prefix = output.with_extension("");
        let size = self.config.max_dimension.to_string();
        self.run_tool(
            &self.config.pdftoppm_path,
            &[
                "-jpeg",
                "-f",
                "1",
                "-l",
                "1",
                "-singlefile",
                "-scale-to",
                size.as_str(),
                path_str(artifact)?,
                path_str(&prefix)?,
            ],
        )
        .await
    }

    async fn from_image(&self, artifact: &Path, output: &Path) -> Result<()> {
        let (input, out, max) = (
            artifact.to_path_buf(),
            output.to_path_buf(),
            self.config.max_dimension,
        );
        tokio::task::spawn_blocking(move || {
            let img = image::open(&input).context("图片解码失败")?;
            save_scaled(img, &out, max)
        })
        .await
        .map_err(|e| anyhow!("缩略图任务异常退出: {}", e))?
    }

    async fn from_apk(&self, artifact: &Path, output: &Path) -> Result<()> {
        let (input, out, max) = (
            artifact.to_path_buf(),
            output.to_path_buf(),
            self.config.max_dimension,
        );
        tokio::task::spawn_blocking(move || {
            let icon = extract_launcher_icon(&input)?;
            let img = image::load_from_memory(&icon).context("图标解码失败")?;
            save_scaled(img, &out, max)
        })
        .await
        .map_err(|e| anyhow!("缩略图任务异常退出: {}", e))?
    }
}

/// 不转码音频，直接复制封面图像流
fn cover_art_args<'a>(input: &'a str, output: &'a str) -> [&'a str; 7] {
    ["-i", input, "-an", "-vcodec", "copy", "-y", output]
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("路径不是有效的 UTF-8: {:?}", path))
}

fn save_scaled(img: image::DynamicImage, output: &Path, max: u32) -> Result<()> {
    let img = if img.width() > max || img.height() > max {
        img.thumbnail(max, max)
    } else {
        img
    };
    img.to_rgb8()
        .save_with_format(output, ImageFormat::Jpeg)
        .context("写入缩略图失败")
}

/// 取 APK 中尺寸最大的 launcher 图标（PNG）
fn extract_launcher_icon(apk: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(apk).context("打开 APK 失败")?;
    let mut archive = zip::ZipArchive::new(file).context("APK 不是有效的 zip")?;

    let mut best: Option<(usize, u64)> = None;
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        let name = entry.name().to_ascii_lowercase();
        if !name.ends_with(".png") || !name.contains("ic_launcher") {
            continue;
        }
        if best.map_or(true, |(_, size)| entry.size() > size) {
            best = Some((index, entry.size()));
        }
    }

    let (index, size) = best.ok_or_else(|| anyhow!("APK 中没有 launcher 图标"))?;
    let mut entry = archive.by_index(index)?;
    let mut data = Vec::with_capacity(size as usize);
    entry.read_to_end(&mut data)?;
    Ok(data)
}

async fn is_non_empty_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

async fn discard(path: &Path) {
    if tokio::fs::metadata(path).await.is_ok() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!("删除无效缩略图失败: {:?}, {}", path, e);
        }
    }
}

/// 下载配置的默认缩略图到 `dest`
///
/// 在上传阶段没有生成缩略图时使用
pub async fn fetch_default_thumbnail(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Option<PathBuf> {
    match download_to(client, url, dest).await {
        Ok(()) => Some(dest.to_path_buf()),
        Err(e) => {
            warn!("默认缩略图下载失败: {}, {:#}", url, e);
            None
        }
    }
}

async fn download_to(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        bail!("默认缩略图为空");
    }
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}
