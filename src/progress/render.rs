//! 进度文本渲染（纯函数）

use super::{Eta, ProgressSnapshot};
use crate::common::format::{human_bytes, human_duration};
use crate::task::TaskState;

const FILLED: char = '█';
const EMPTY: char = '░';

/// 渲染固定分段数的进度条
///
/// 总大小未知时全部为空
pub fn render_bar(snapshot: &ProgressSnapshot, segments: usize) -> String {
    let filled = match snapshot.percent {
        Some(pct) => {
            let ratio = (pct / 100.0).clamp(0.0, 1.0);
            ((ratio * segments as f64).round() as usize).min(segments)
        }
        None => 0,
    };

    let mut bar = String::with_capacity(segments * FILLED.len_utf8());
    bar.extend(std::iter::repeat(FILLED).take(filled));
    bar.extend(std::iter::repeat(EMPTY).take(segments - filled));
    bar
}

/// 阶段标题
pub fn stage_label(stage: TaskState) -> &'static str {
    match stage {
        TaskState::Queued => "⏳ Queued",
        TaskState::Downloading => "📥 Downloading",
        TaskState::Thumbnailing => "🖼 Preparing thumbnail",
        TaskState::Uploading => "📤 Uploading",
        TaskState::Completed => "✅ Completed",
        TaskState::Failed => "❌ Failed",
        TaskState::Cancelled => "🚫 Cancelled",
    }
}

/// 渲染状态消息正文
pub fn render_status(
    stage: TaskState,
    file_name: &str,
    snapshot: &ProgressSnapshot,
    segments: usize,
) -> String {
    let mut lines = vec![stage_label(stage).to_string(), format!("📁 {}", file_name)];

    match (snapshot.percent, snapshot.bytes_total) {
        (Some(pct), Some(total)) => {
            lines.push(format!("[{}] {:.1}%", render_bar(snapshot, segments), pct));
            lines.push(format!(
                "{} / {}",
                human_bytes(snapshot.bytes_transferred),
                human_bytes(total)
            ));
        }
        _ => lines.push(format!(
            "{} transferred",
            human_bytes(snapshot.bytes_transferred)
        )),
    }

    let eta = match snapshot.eta {
        Eta::Known(d) => human_duration(d),
        Eta::Unknown => "unknown".to_string(),
    };
    lines.push(format!(
        "⚡ {}/s · ⏱ {}",
        human_bytes(snapshot.speed as u64),
        eta
    ));

    lines.join("\n")
}
