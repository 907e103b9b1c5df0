//! 进度跟踪器
//!
//! 按任务记录字节数采样，基于滑动窗口计算速度，避免分块到达不均匀带来的抖动

use crate::task::TaskId;
use dashmap::DashMap;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 剩余时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Known(Duration),
    /// 速度为 0 或总大小未知
    Unknown,
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Eta::Known(d) => serializer.serialize_some(&d.as_secs()),
            Eta::Unknown => serializer.serialize_none(),
        }
    }
}

/// 进度快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    /// 总大小未知时为 None
    pub percent: Option<f64>,
    /// 字节/秒
    pub speed: f64,
    /// 剩余秒数，未知时为 null
    #[serde(rename = "eta_secs")]
    pub eta: Eta,
}

impl ProgressSnapshot {
    /// 尚无采样时的快照
    pub fn empty(total: Option<u64>) -> Self {
        Self {
            bytes_transferred: 0,
            bytes_total: total,
            percent: total.map(|t| if t == 0 { 100.0 } else { 0.0 }),
            speed: 0.0,
            eta: Eta::Unknown,
        }
    }
}

#[derive(Debug)]
struct Series {
    total: Option<u64>,
    bytes: u64,
    /// 按时间排序的采样点，保留一个不晚于窗口起点的锚点
    samples: VecDeque<(Instant, u64)>,
}

impl Series {
    fn new(total: Option<u64>) -> Self {
        Self {
            total,
            bytes: 0,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, bytes_so_far: u64, at: Instant, window: Duration) {
        let bytes = match self.total {
            Some(total) => bytes_so_far.min(total),
            None => bytes_so_far,
        };
        self.bytes = self.bytes.max(bytes);

        // 时间倒退的采样只更新字节数
        if let Some(&(last_at, _)) = self.samples.back() {
            if at < last_at {
                return;
            }
        }
        self.samples.push_back((at, self.bytes));

        if let Some(edge) = at.checked_sub(window) {
            while self.samples.len() > 2 && self.samples[1].0 <= edge {
                self.samples.pop_front();
            }
        }
    }

    fn speed_at(&self, now: Instant) -> f64 {
        let (Some(&(first_at, first_bytes)), Some(&(last_at, _))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let end = if now > last_at { now } else { last_at };
        let elapsed = end.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes.saturating_sub(first_bytes) as f64 / elapsed
    }

    fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let speed = self.speed_at(now);
        let percent = self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                self.bytes as f64 / total as f64 * 100.0
            }
        });
        let eta = match self.total {
            Some(total) if self.bytes >= total => Eta::Known(Duration::ZERO),
            Some(total) if speed > 0.0 => {
                Eta::Known(Duration::from_secs_f64((total - self.bytes) as f64 / speed))
            }
            _ => Eta::Unknown,
        };
        ProgressSnapshot {
            bytes_transferred: self.bytes,
            bytes_total: self.total,
            percent,
            speed,
            eta,
        }
    }
}

/// 进度跟踪器
///
/// 每个任务一条采样序列，阶段切换时调用 `begin` 重新计数
#[derive(Debug)]
pub struct ProgressTracker {
    window: Duration,
    series: DashMap<TaskId, Series>,
}

impl ProgressTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            series: DashMap::new(),
        }
    }

    /// 开始一个新的传输阶段
    pub fn begin(&self, task_id: &str, total: Option<u64>) {
        self.series.insert(task_id.to_string(), Series::new(total));
    }

    /// 更新当前阶段总大小
    pub fn set_total(&self, task_id: &str, total: Option<u64>) {
        if let Some(mut series) = self.series.get_mut(task_id) {
            series.total = total;
            if let Some(total) = total {
                series.bytes = series.bytes.min(total);
            }
        }
    }

    /// 记录采样点
    pub fn record(&self, task_id: &str, bytes_so_far: u64, at: Instant) {
        let window = self.window;
        self.series
            .entry(task_id.to_string())
            .or_insert_with(|| Series::new(None))
            .push(bytes_so_far, at, window);
    }

    pub fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.snapshot_at(task_id, Instant::now())
    }

    pub fn snapshot_at(&self, task_id: &str, now: Instant) -> Option<ProgressSnapshot> {
        self.series.get(task_id).map(|s| s.snapshot_at(now))
    }

    /// 移除任务的采样数据
    pub fn forget(&self, task_id: &str) {
        self.series.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
