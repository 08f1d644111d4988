// 播放器核心模块：数据源、选流、协调器与输出管线

pub mod audio;
pub mod coordinator;
pub mod current_stream;
pub mod edl;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;
pub mod pipeline;
pub mod pipeline_thread;
pub mod ranking;
pub mod registry;
pub mod source;
pub mod source_factory;
pub mod synthetic;
pub mod text_subtitle;

pub use coordinator::{PlayerHandle, SessionOptions};
pub use edl::Edl;
pub use pipeline::{OutputPipeline, PipelineContext, PipelineSet};
pub use pipeline_thread::{NullConsumer, ThreadedPipeline};
pub use source::{Source, SourceCaps};
pub use source_factory::SourceFactory;
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use text_subtitle::TextSubtitleSource;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_source::FfmpegSource;

use std::process;
use std::thread;

pub(crate) fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}
