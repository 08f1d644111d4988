use crate::core::Result;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// 剪辑动作（.edl 文件第三列的数字）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdlAction {
    /// 0：剪掉，播放时跳过
    Cut,
    /// 1：静音
    Mute,
    /// 2：场景标记
    Scene,
    /// 3：广告段，播放到时自动跳过一次
    CommBreak,
}

impl EdlAction {
    fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(EdlAction::Cut),
            "1" => Some(EdlAction::Mute),
            "2" => Some(EdlAction::Scene),
            "3" => Some(EdlAction::CommBreak),
            _ => None,
        }
    }
}

/// 一个剪辑区间 [start_ms, end_ms)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    pub start_ms: i64,
    pub end_ms: i64,
    pub action: EdlAction,
}

impl Edit {
    pub fn contains(&self, time_ms: i64) -> bool {
        time_ms >= self.start_ms && time_ms < self.end_ms
    }

    pub fn length_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// 剪辑决策表
#[derive(Debug, Clone, Default)]
pub struct Edl {
    edits: Vec<Edit>,
}

/// 解析时间：秒（可带小数）或 HH:MM:SS(.mmm)
fn parse_time_ms(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.contains(':') {
        let mut total = 0.0f64;
        for part in text.split(':') {
            let value: f64 = part.parse().ok()?;
            total = total * 60.0 + value;
        }
        return Some((total * 1000.0).round() as i64);
    }
    let seconds: f64 = text.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some((seconds * 1000.0).round() as i64)
}

impl Edl {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 `start end action` 格式的文本，无效行跳过
    pub fn parse(text: &str) -> Self {
        let mut edl = Edl::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let parsed = match fields.as_slice() {
                [start, end] => Some((parse_time_ms(start), parse_time_ms(end), Some(EdlAction::Cut))),
                [start, end, action, ..] => Some((
                    parse_time_ms(start),
                    parse_time_ms(end),
                    EdlAction::from_code(action),
                )),
                _ => None,
            };
            match parsed {
                Some((Some(start_ms), Some(end_ms), Some(action))) => {
                    if !edl.add_edit(Edit { start_ms, end_ms, action }) {
                        warn!("⚠️ EDL 第 {} 行与已有区间重叠或无效，已忽略: {}", line_no + 1, line);
                    }
                }
                _ => warn!("⚠️ EDL 第 {} 行无法解析，已忽略: {}", line_no + 1, line),
            }
        }
        edl
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let edl = Self::parse(&text);
        info!(
            "✂️ 加载 EDL: {}（{} 个区间，剪切共 {}ms）",
            path.display(),
            edl.edits.len(),
            edl.total_cut_time_ms()
        );
        Ok(edl)
    }

    /// 媒体文件旁的 .edl 文件
    pub fn sidecar_path(media: &Path) -> PathBuf {
        media.with_extension("edl")
    }

    /// 加入一个区间；与已有区间重叠或长度非正时拒绝
    pub fn add_edit(&mut self, edit: Edit) -> bool {
        if edit.end_ms <= edit.start_ms {
            return false;
        }
        let overlaps = self
            .edits
            .iter()
            .any(|e| edit.start_ms < e.end_ms && e.start_ms < edit.end_ms);
        if overlaps && edit.action != EdlAction::Scene {
            return false;
        }
        let position = self
            .edits
            .iter()
            .position(|e| e.start_ms > edit.start_ms)
            .unwrap_or(self.edits.len());
        self.edits.insert(position, edit);
        true
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn has_cuts(&self) -> bool {
        self.edits.iter().any(|e| e.action == EdlAction::Cut)
    }

    /// 某一时刻落在哪个区间（场景标记不算）
    pub fn in_edit(&self, time_ms: i64) -> Option<&Edit> {
        self.edits
            .iter()
            .find(|e| e.action != EdlAction::Scene && e.contains(time_ms))
    }

    pub fn total_cut_time_ms(&self) -> i64 {
        self.cuts().map(Edit::length_ms).sum()
    }

    fn cuts(&self) -> impl Iterator<Item = &Edit> {
        self.edits.iter().filter(|e| e.action == EdlAction::Cut)
    }

    /// 源时间 → 去掉剪切后的显示时间
    pub fn remove_cut_time(&self, time_ms: i64) -> i64 {
        let mut cut_time = 0;
        for cut in self.cuts() {
            if time_ms >= cut.end_ms {
                cut_time += cut.length_ms();
            } else if time_ms >= cut.start_ms {
                cut_time += time_ms - cut.start_ms;
            }
        }
        time_ms - cut_time
    }

    /// 显示时间 → 源时间（remove_cut_time 的逆）
    pub fn restore_cut_time(&self, time_ms: i64) -> i64 {
        let mut restored = time_ms;
        for cut in self.cuts() {
            if restored >= cut.start_ms {
                restored += cut.length_ms();
            }
        }
        restored
    }
}
