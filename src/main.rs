use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use log::{info, warn};
use myy_player_core::core::{PlayerSettings, SessionOutcome, StreamType};
use myy_player_core::player::audio::AudioSinkConsumer;
use myy_player_core::player::{
    Edl, NullConsumer, PipelineContext, PipelineSet, PlayerHandle, SessionOptions, Source,
    SyntheticConfig, SyntheticSource, TextSubtitleSource, ThreadedPipeline,
};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 无界面的播放演示
///
/// 用法：`myy_player_core [媒体文件] [--settings 配置.json]`
/// 不给媒体文件时播放一个 5 秒的合成数据源。
struct Args {
    media: Option<PathBuf>,
    settings: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        media: None,
        settings: None,
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--settings" => {
                let path = iter.next().context("--settings 缺少文件路径")?;
                args.settings = Some(PathBuf::from(path));
            }
            _ => args.media = Some(PathBuf::from(arg)),
        }
    }
    Ok(args)
}

fn build_pipelines(context: PipelineContext) -> PipelineSet {
    #[cfg(feature = "cpal-output")]
    let audio_factory = AudioSinkConsumer::factory(myy_player_core::player::audio::CpalAudioDevice::new);
    #[cfg(not(feature = "cpal-output"))]
    let audio_factory = AudioSinkConsumer::factory(|| Ok(myy_player_core::player::audio::NullAudioDevice::new()));

    PipelineSet::new()
        .with(
            StreamType::Audio,
            Box::new(ThreadedPipeline::new(StreamType::Audio, audio_factory, &context, true)),
        )
        .with(
            StreamType::Video,
            Box::new(ThreadedPipeline::new(StreamType::Video, NullConsumer::factory(), &context, true)),
        )
        .with(
            StreamType::Subtitle,
            Box::new(ThreadedPipeline::new(StreamType::Subtitle, NullConsumer::factory(), &context, true)),
        )
}

#[cfg(feature = "ffmpeg")]
fn open_media(path: &Path) -> myy_player_core::core::Result<Box<dyn Source>> {
    let source = myy_player_core::player::FfmpegSource::open(&path.to_string_lossy())?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_media(path: &Path) -> myy_player_core::core::Result<Box<dyn Source>> {
    Err(myy_player_core::core::PlayerError::OpenError(format!(
        "{}: 未启用 ffmpeg 特性，只能播放合成数据源",
        path.display()
    )))
}

fn synthetic_source() -> Box<dyn Source> {
    Box::new(SyntheticSource::new(SyntheticConfig {
        duration_ms: 5000,
        audio_languages: vec!["eng".to_string(), "jpn".to_string()],
        subtitle_languages: vec!["eng".to_string()],
        subtitle_interval_ms: 1000,
        ..Default::default()
    }))
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY Player 同步核心演示启动");

    let args = parse_args()?;
    let settings = match &args.settings {
        Some(path) => PlayerSettings::from_json_file(path)
            .with_context(|| format!("无法加载配置 {}", path.display()))?,
        None => PlayerSettings::default(),
    };

    let mut edl = Edl::new();
    if let (Some(media), true) = (&args.media, settings.edl.load_sidecar) {
        let edl_path = Edl::sidecar_path(media);
        if edl_path.exists() {
            match Edl::from_file(&edl_path) {
                Ok(loaded) => edl = loaded,
                Err(e) => warn!("⚠️ EDL 加载失败 {}: {}", edl_path.display(), e),
            }
        }
    }

    let options = SessionOptions { settings, edl };
    let (done_tx, done_rx) = unbounded();
    let on_complete = move |outcome: SessionOutcome| {
        let _ = done_tx.send(outcome);
    };

    let mut handle = match &args.media {
        Some(media) => {
            let media = media.clone();
            PlayerHandle::open(options, move |_attempt| open_media(&media), build_pipelines, on_complete)?
        }
        None => PlayerHandle::spawn(synthetic_source(), options, build_pipelines, on_complete)?,
    };

    if let Some(media) = &args.media {
        if let Some(path) = TextSubtitleSource::find_sidecar_files(media).into_iter().next() {
            match TextSubtitleSource::open(&path) {
                Ok(subtitles) => handle.add_subtitle_source(Box::new(subtitles)),
                Err(e) => warn!("⚠️ 外挂字幕打开失败 {}: {}", path.display(), e),
            }
        }
    }

    let outcome = loop {
        match done_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(outcome) => break outcome,
            Err(RecvTimeoutError::Timeout) => {
                let state = handle.play_state();
                info!(
                    "⏱ {}ms / {}ms 速度={} 缓冲={} 水位={:.0}%",
                    state.time_ms,
                    state.total_time_ms,
                    state.speed,
                    state.caching,
                    state.cache_level * 100.0
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("协调器线程意外退出");
            }
        }
    };
    handle.join();

    match outcome {
        SessionOutcome::Ended => info!("🏁 播放完成"),
        SessionOutcome::Stopped => info!("⏹ 播放已停止"),
        SessionOutcome::Failed(e) => return Err(e).context("播放失败"),
    }
    Ok(())
}
