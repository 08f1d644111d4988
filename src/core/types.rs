use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 内部时间基：1 秒 = 1_000_000（微秒）
pub const TIME_BASE: i64 = 1_000_000;

/// 播放速度（千分比）：暂停
pub const PLAYSPEED_PAUSE: i32 = 0;
/// 播放速度（千分比）：正常 1x
pub const PLAYSPEED_NORMAL: i32 = 1000;

/// 毫秒转内部时间（微秒）
pub const fn msec_to_time(ms: i64) -> i64 {
    ms * 1000
}

/// 秒转内部时间（微秒）
pub const fn sec_to_time(sec: i64) -> i64 {
    sec * TIME_BASE
}

/// 内部时间（微秒）转毫秒
pub const fn time_to_msec(time: i64) -> i64 {
    time / 1000
}

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
    Subtitle,
    Teletext,
    /// 数据广播（如 RDS）
    DataService,
}

impl StreamType {
    pub const ALL: [StreamType; 5] = [
        StreamType::Audio,
        StreamType::Video,
        StreamType::Subtitle,
        StreamType::Teletext,
        StreamType::DataService,
    ];

    /// 在 `ALL` 中的下标
    pub fn index(&self) -> usize {
        match self {
            StreamType::Audio => 0,
            StreamType::Video => 1,
            StreamType::Subtitle => 2,
            StreamType::Teletext => 3,
            StreamType::DataService => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::Subtitle => "subtitle",
            StreamType::Teletext => "teletext",
            StreamType::DataService => "data-service",
        }
    }
}

/// 流的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    /// 主解封装器
    Demux,
    /// 外挂字幕解封装器
    DemuxSub,
    /// 视频流内嵌的隐藏字幕（CC）
    VideoMux,
    /// 交互菜单导航器（DVD/蓝光）
    Nav,
    /// 外部文本字幕文件
    Text,
}

impl StreamSource {
    /// 是否为外挂字幕
    pub fn is_external(&self) -> bool {
        matches!(self, StreamSource::DemuxSub | StreamSource::Text)
    }
}

/// 流标志位
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFlags {
    pub default: bool,
    pub forced: bool,
    pub hearing_impaired: bool,
    pub visual_impaired: bool,
    /// 原始语言音轨
    pub original: bool,
}

/// 数据源报告的流信息（也作为打开输出管线时的格式提示）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// 数据源内部 ID
    pub id: i32,
    pub stream_type: Option<StreamType>,
    pub codec: String,
    pub language: String,
    pub name: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub width: u32,
    pub height: u32,
    pub flags: StreamFlags,
    /// 格式变更计数：ID 不变但格式变化时递增
    pub changes: u32,
    /// 打开失败后永久禁用
    pub disabled: bool,
    pub filename: Option<PathBuf>,
}

/// 解封装后的数据包
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemuxPacket {
    pub stream_id: i32,
    /// 解码时间戳（微秒）
    pub dts: Option<i64>,
    /// 显示时间戳（微秒）
    pub pts: Option<i64>,
    /// 时长（微秒）
    pub duration: Option<i64>,
    pub data: Vec<u8>,
    /// 已应用的时间戳修正量（微秒）
    pub pts_offset_correction: i64,
}

impl DemuxPacket {
    /// 从两个时间戳中减去修正量
    pub fn apply_correction(&mut self, correction: i64) {
        self.pts_offset_correction = correction;
        if let Some(dts) = self.dts.as_mut() {
            *dts -= correction;
        }
        if let Some(pts) = self.pts.as_mut() {
            *pts -= correction;
        }
    }

    /// 标记时间戳未知（等待另一路流确认跳变）
    pub fn invalidate_timestamps(&mut self) {
        self.dts = None;
        self.pts = None;
    }
}

/// 章节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub name: String,
    /// 起始时间（毫秒）
    pub start_ms: i64,
}

/// Seek 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    /// 目标时间（毫秒）
    pub time_ms: i64,
    /// 相对当前时间
    pub relative: bool,
    /// 方向提示：向后找关键帧
    pub backward: bool,
    /// 精确 Seek（丢弃目标之前的包）；否则停在最近的关键帧
    pub accurate: bool,
    /// 目标时间是去除 EDL 剪切后的显示时间，需要还原
    pub restore: bool,
    /// 快进快退内部 Seek，不通知 UI
    pub trickplay: bool,
    /// 完成后对时钟做不连续跳转
    pub sync: bool,
}

impl SeekRequest {
    /// 用户发起的普通精确 Seek
    pub fn to(time_ms: i64) -> Self {
        Self {
            time_ms,
            relative: false,
            backward: false,
            accurate: true,
            restore: true,
            trickplay: false,
            sync: true,
        }
    }
}

/// 会话结果（通过完成回调报告）
#[derive(Debug)]
pub enum SessionOutcome {
    /// 播放到结尾
    Ended,
    /// 被调用方停止
    Stopped,
    /// 播放失败
    Failed(crate::core::PlayerError),
}

/// 播放器状态快照（供 UI 轮询）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayState {
    pub time_ms: i64,
    pub total_time_ms: i64,
    /// 当前章节（从 1 开始，0 表示无章节）
    pub chapter: usize,
    pub chapter_count: usize,
    pub can_seek: bool,
    pub can_pause: bool,
    /// 缓冲水位 0.0 - 1.0
    pub cache_level: f32,
    pub is_in_menu: bool,
    /// 是否处于缓冲状态
    pub caching: bool,
    pub speed: i32,
    pub audio_stream: Option<usize>,
    pub video_stream: Option<usize>,
    pub subtitle_stream: Option<usize>,
    pub subtitle_visible: bool,
    /// 首次同步完成
    pub streams_ready: bool,
}
