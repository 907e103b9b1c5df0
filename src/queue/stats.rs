//! 用户任务统计与批次汇总

use crate::task::{MediaKind, TaskSnapshot, TaskState};
use serde::Serialize;
use std::collections::BTreeMap;

/// 排队位置（从 1 开始）
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QueuePosition {
    pub position: usize,
    /// 当前等待中的任务总数
    pub pending: usize,
}

/// 用户任务统计
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OwnerStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 排队或处理中
    pub pending: usize,
    /// 已完成任务按媒体类型计数
    pub file_types: BTreeMap<String, usize>,
}

impl OwnerStats {
    pub fn from_tasks(tasks: &[TaskSnapshot]) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.state {
                TaskState::Completed => {
                    stats.completed += 1;
                    let kind = task.media_kind.unwrap_or(MediaKind::Document);
                    *stats.file_types.entry(kind.as_str().to_string()).or_default() += 1;
                }
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
                _ => stats.pending += 1,
            }
        }
        stats
    }

    /// 所有任务都已结束
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.pending == 0
    }
}

fn kind_icon(kind: &str) -> &'static str {
    match kind {
        "video" => "🎬",
        "audio" => "🎵",
        "image" => "🖼",
        "pdf" => "📄",
        "apk" => "📱",
        "archive" => "🗜",
        _ => "📁",
    }
}

/// 批次汇总文本
pub fn render_summary(stats: &OwnerStats) -> String {
    let headline = if stats.total > 0 && stats.completed == stats.total {
        "🎉 All tasks completed successfully!"
    } else if stats.completed > 0 {
        "✨ Tasks completed with some issues."
    } else {
        "😔 No task completed."
    };

    let mut lines = vec![
        headline.to_string(),
        String::new(),
        "📊 Task Summary".to_string(),
        format!("✅ Successful: {}", stats.completed),
        format!("❌ Failed: {}", stats.failed),
    ];
    if stats.cancelled > 0 {
        lines.push(format!("🚫 Cancelled: {}", stats.cancelled));
    }
    if stats.pending > 0 {
        lines.push(format!("⏳ In progress: {}", stats.pending));
    }
    lines.push(format!("📁 Total: {}", stats.total));

    if !stats.file_types.is_empty() {
        lines.push(String::new());
        lines.push("📋 File Types:".to_string());
        for (kind, count) in &stats.file_types {
            lines.push(format!("{} {}: {}", kind_icon(kind), kind, count));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SourceDescriptor, Task, TaskErrorKind, Tier};

    fn snapshot(state: TaskState, kind: Option<MediaKind>) -> TaskSnapshot {
        let mut task = Task::new(1, SourceDescriptor::new("https://example.com/f"), Tier::Free);
        task.media_kind = kind;
        match state {
            TaskState::Completed => {
                task.transition(TaskState::Downloading);
                task.transition(TaskState::Uploading);
                task.mark_completed();
            }
            TaskState::Failed => {
                task.transition(TaskState::Downloading);
                task.mark_failed(TaskErrorKind::DownloadFailed, "boom");
            }
            TaskState::Cancelled => {
                task.mark_cancelled();
            }
            TaskState::Downloading => {
                task.transition(TaskState::Downloading);
            }
            _ => {}
        }
        task.snapshot()
    }

    #[test]
    fn test_stats_counts_states_and_kinds() {
        let tasks = vec![
            snapshot(TaskState::Completed, Some(MediaKind::Video)),
            snapshot(TaskState::Completed, Some(MediaKind::Video)),
            snapshot(TaskState::Completed, None),
            snapshot(TaskState::Failed, Some(MediaKind::Pdf)),
            snapshot(TaskState::Cancelled, None),
            snapshot(TaskState::Downloading, None),
            snapshot(TaskState::Queued, None),
        ];
        let stats = OwnerStats::from_tasks(&tasks);

        assert_eq!(stats.total, 7);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.file_types.get("video"), Some(&2));
        assert_eq!(stats.file_types.get("document"), Some(&1));
        assert!(stats.file_types.get("pdf").is_none());
        assert!(!stats.is_settled());
    }

    #[test]
    fn test_render_summary() {
        let all_done = OwnerStats::from_tasks(&[
            snapshot(TaskState::Completed, Some(MediaKind::Audio)),
            snapshot(TaskState::Completed, Some(MediaKind::Audio)),
        ]);
        assert!(all_done.is_settled());
        let text = render_summary(&all_done);
        assert!(text.starts_with("🎉"));
        assert!(text.contains("✅ Successful: 2"));
        assert!(text.contains("🎵 audio: 2"));

        let mixed = OwnerStats::from_tasks(&[
            snapshot(TaskState::Completed, Some(MediaKind::Image)),
            snapshot(TaskState::Failed, None),
        ]);
        let text = render_summary(&mixed);
        assert!(text.starts_with("✨"));
        assert!(text.contains("❌ Failed: 1"));

        let none = OwnerStats::from_tasks(&[snapshot(TaskState::Failed, None)]);
        assert!(render_summary(&none).starts_with("😔"));
        assert!(!render_summary(&none).contains("File Types"));
    }
}
