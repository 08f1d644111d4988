use crate::core::{PlayerError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 播放器配置
///
/// 所有字段都有默认值，JSON 文件里只需要写想覆盖的部分。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// 首选音轨语言：ISO 639 代码，或 "original" / "mediadefault"
    pub audio_language: String,
    /// 首选字幕语言：ISO 639 代码，或 "original" / "none" / "forced_only"
    pub subtitle_language: String,
    /// 用户开启了字幕
    pub subtitles_on: bool,
    /// 选流时优先考虑 default 标志
    pub prefer_default_flag: bool,
    /// 选流时优先立体声（否则声道越多越好）
    pub prefer_stereo: bool,
    pub accessibility: AccessibilitySettings,
    pub sync: SyncSettings,
    pub open_retry: OpenRetryConfig,
    pub edl: EdlSettings,
    pub pipeline: PipelineSettings,
    /// UI 状态快照最小刷新间隔（毫秒）
    pub play_state_interval_ms: u64,
}

/// 无障碍选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessibilitySettings {
    /// 优先为视障人士准备的音轨
    pub audio_visual: bool,
    /// 优先为听障人士准备的音轨
    pub audio_hearing: bool,
    /// 优先为听障人士准备的字幕
    pub subtitle_hearing: bool,
}

/// 同步与缓冲相关的阈值
///
/// 连续性检查的几个阈值来自经验调优，保持原值，修改会直接表现为音画故障。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 超过当前最大 DTS 多少毫秒视为向前跳变
    pub forward_jump_ms: i64,
    /// 低于本路流末尾多少毫秒视为向后跳变
    pub backward_jump_ms: i64,
    /// 音视频上一 DTS 相差多少毫秒以内才立即应用修正
    pub agreement_window_ms: i64,
    /// 距 Seek 目标超过多少毫秒就放弃逐包解码到目标
    pub start_pts_giveup_ms: i64,
    /// 缓冲状态强制推进的超时（毫秒）
    pub caching_timeout_ms: u64,
    /// 同步完成后多久内不处理卡顿（毫秒）
    pub sync_timer_ms: u64,
    /// 直播源额外等待的毫秒数
    pub live_wait_ms: i64,
    /// 快进快退时允许的时钟误差（毫秒，会随速度放宽）
    pub trickplay_error_ms: i64,
    /// 快进时误差放宽倍数上限
    pub trickplay_max_widening: f64,
    /// 一路流没有包、另一路超过多少包时不再等待它
    pub startup_packet_threshold: u64,
    /// 直播源的同上阈值
    pub realtime_packet_threshold: u64,
    /// 同步屏障超时（毫秒）
    pub synchronize_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            forward_jump_ms: 1000,
            backward_jump_ms: 500,
            agreement_window_ms: 1000,
            start_pts_giveup_ms: 20_000,
            caching_timeout_ms: 5000,
            sync_timer_ms: 3000,
            live_wait_ms: 400,
            trickplay_error_ms: 1000,
            trickplay_max_widening: 8.0,
            startup_packet_threshold: 20,
            realtime_packet_threshold: 40,
            synchronize_timeout_ms: 1000,
        }
    }
}

/// 打开数据源的重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for OpenRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_interval_ms: 500,
        }
    }
}

/// EDL（剪辑决策表）行为
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdlSettings {
    /// 自动加载媒体文件旁的 .edl 文件
    pub load_sidecar: bool,
    /// 剪切区间直接跳过（否则只作标记）
    pub skip_cuts: bool,
}

impl Default for EdlSettings {
    fn default() -> Self {
        Self {
            load_sidecar: true,
            skip_cuts: true,
        }
    }
}

/// 输出管线队列容量（数据包个数，水位按此计算）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub audio_queue_packets: usize,
    pub video_queue_packets: usize,
    pub other_queue_packets: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        // 视频：200 packets ≈ 8秒（25fps）
        // 音频：150 packets ≈ 3秒（48kHz）
        Self {
            audio_queue_packets: 150,
            video_queue_packets: 200,
            other_queue_packets: 100,
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            audio_language: "original".to_string(),
            subtitle_language: "original".to_string(),
            subtitles_on: true,
            prefer_default_flag: true,
            prefer_stereo: false,
            accessibility: AccessibilitySettings::default(),
            sync: SyncSettings::default(),
            open_retry: OpenRetryConfig::default(),
            edl: EdlSettings::default(),
            pipeline: PipelineSettings::default(),
            play_state_interval_ms: 200,
        }
    }
}

impl PlayerSettings {
    /// 从 JSON 字符串解析
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: &Path) -> Result<Self> {
        info!("📄 加载配置文件: {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.open_retry.max_attempts == 0 {
            return Err(PlayerError::SettingsError(
                "open_retry.max_attempts 至少为 1".to_string(),
            ));
        }
        let pipeline = &self.pipeline;
        if pipeline.audio_queue_packets == 0
            || pipeline.video_queue_packets == 0
            || pipeline.other_queue_packets == 0
        {
            return Err(PlayerError::SettingsError("管线队列容量不能为 0".to_string()));
        }
        if self.sync.trickplay_max_widening < 1.0 {
            return Err(PlayerError::SettingsError(
                "sync.trickplay_max_widening 不能小于 1".to_string(),
            ));
        }
        Ok(())
    }
}
