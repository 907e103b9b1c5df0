//! 启动恢复
//!
//! 上次运行异常退出时，暂存目录里可能残留下载产物和缩略图。启动时整体清理，
//! 内存中的槽位计数从零开始，不需要额外恢复

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// 清理结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

/// 清空暂存目录（保留目录本身）
pub fn sweep_staging_dir(dir: &Path) -> Result<SweepReport> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).with_context(|| format!("创建暂存目录失败: {:?}", dir))?;
        return Ok(SweepReport::default());
    }

    let mut report = SweepReport::default();

    // contents_first 保证先删文件再删目录
    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("遍历暂存目录失败: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if entry.file_type().is_dir() {
            if let Err(e) = std::fs::remove_dir(path) {
                warn!("删除残留目录失败: {:?}, {}", path, e);
            }
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(path) {
            Ok(()) => {
                report.files_removed += 1;
                report.bytes_freed += size;
            }
            Err(e) => warn!("删除残留文件失败: {:?}, {}", path, e),
        }
    }

    if report.files_removed > 0 {
        info!(
            "已清理上次运行残留的 {} 个文件 ({} bytes)",
            report.files_removed, report.bytes_freed
        );
    }
    Ok(report)
}
