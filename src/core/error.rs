use crate::core::StreamType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("无法打开: {0}")]
    OpenError(String),

    #[error("数据源不可用（已重试 {attempts} 次）")]
    SourceUnavailable { attempts: u32 },

    #[error("无法打开{stream_type:?}流 {id}: {reason}")]
    StreamOpen {
        stream_type: StreamType,
        id: i32,
        reason: String,
    },

    #[error("输出管线错误: {0}")]
    PipelineError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    SettingsError(String),

    #[error("播放已中止")]
    Aborted,

    #[error("播放意外停止: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
