use crate::core::{Chapter, DemuxPacket, PlayerError, Result, StreamFlags, StreamInfo, StreamType};
use crate::player::log_ctx;
use crate::player::source::{Source, SourceCaps};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::stream::Disposition;
use ffmpeg_next::{format, media, Rational};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 微秒时基
const TIME_BASE_US: i64 = 1_000_000;

fn is_network(path: &str) -> bool {
    path.starts_with("http://")
        || path.starts_with("https://")
        || path.starts_with("rtsp://")
        || path.starts_with("rtmp://")
        || path.contains(".m3u8")
}

fn is_live(path: &str) -> bool {
    path.starts_with("rtsp://") || path.starts_with("rtmp://")
}

/// 流时基下的时间戳 → 微秒
fn to_us(ts: i64, time_base: Rational) -> i64 {
    let num = time_base.numerator() as i128;
    let den = time_base.denominator().max(1) as i128;
    (ts as i128 * num * TIME_BASE_US as i128 / den) as i64
}

/// 基于 FFmpeg 的解封装数据源
pub struct FfmpegSource {
    input: format::context::Input,
    streams: Vec<StreamInfo>,
    /// 按流索引的时基
    time_bases: Vec<Rational>,
    chapters: Vec<Chapter>,
    duration_ms: i64,
    caps: SourceCaps,
    path: String,
    abort: Arc<AtomicBool>,
}

impl FfmpegSource {
    /// 打开媒体文件或网络流
    pub fn open(path: &str) -> Result<Self> {
        ffmpeg::init()?;
        info!("{} 正在打开: {}", log_ctx(), path);

        let input = if is_network(path) {
            info!("{} 🌐 检测到网络流，应用低延迟选项", log_ctx());
            let mut options = ffmpeg::Dictionary::new();
            // 丢弃损坏帧并补齐缺失的 PTS
            options.set("fflags", "+discardcorrupt+genpts+nobuffer");
            options.set("analyzeduration", "5000000");
            options.set("probesize", "10000000");
            options.set("timeout", "15000000");
            options.set("rw_timeout", "8000000");
            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_delay_max", "4");
            if path.contains(".m3u8") {
                options.set("live_start_index", "-1");
                options.set("max_reload", "10");
                options.set("http_persistent", "1");
            }
            format::input_with_dictionary(&path, options)
                .map_err(|e| PlayerError::OpenError(format!("无法打开网络流: {}", e)))?
        } else {
            format::input(&path)
                .map_err(|e| PlayerError::OpenError(format!("无法打开文件: {}", e)))?
        };

        let mut streams = Vec::new();
        let mut time_bases = Vec::new();
        for stream in input.streams() {
            time_bases.push(stream.time_base());
            if let Some(info) = Self::stream_info(&stream) {
                debug!(
                    "{} 流 #{}: {:?} {} lang={}",
                    log_ctx(),
                    info.id,
                    info.stream_type,
                    info.codec,
                    info.language
                );
                streams.push(info);
            }
        }

        let chapters = input
            .chapters()
            .map(|chapter| Chapter {
                name: chapter.metadata().get("title").unwrap_or_default().to_string(),
                start_ms: to_us(chapter.start(), chapter.time_base()) / 1000,
            })
            .collect();

        let live = is_live(path);
        let duration_ms = input.duration().max(0) / 1000;
        Ok(Self {
            input,
            streams,
            time_bases,
            chapters,
            duration_ms,
            caps: SourceCaps {
                seekable: !live,
                pausable: !live,
                realtime: live,
                menu: false,
            },
            path: path.to_string(),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    fn stream_info(stream: &format::stream::Stream) -> Option<StreamInfo> {
        let parameters = stream.parameters();
        let stream_type = match parameters.medium() {
            media::Type::Video => StreamType::Video,
            media::Type::Audio => StreamType::Audio,
            media::Type::Subtitle => StreamType::Subtitle,
            _ => return None,
        };
        let codec = parameters.id().name().to_string();
        let metadata = stream.metadata();
        let disposition = stream.disposition();

        let mut info = StreamInfo {
            id: stream.index() as i32,
            stream_type: Some(stream_type),
            codec,
            language: metadata.get("language").unwrap_or_default().to_string(),
            name: metadata.get("title").unwrap_or_default().to_string(),
            flags: StreamFlags {
                default: disposition.contains(Disposition::DEFAULT),
                forced: disposition.contains(Disposition::FORCED),
                hearing_impaired: disposition.contains(Disposition::HEARING_IMPAIRED),
                visual_impaired: disposition.contains(Disposition::VISUAL_IMPAIRED),
                original: disposition.contains(Disposition::ORIGINAL),
            },
            ..Default::default()
        };

        // 格式细节只用于管线的格式提示，取不到时留空
        if let Ok(context) = ffmpeg::codec::context::Context::from_parameters(parameters) {
            match stream_type {
                StreamType::Video => {
                    if let Ok(video) = context.decoder().video() {
                        info.width = video.width();
                        info.height = video.height();
                    }
                }
                StreamType::Audio => {
                    if let Ok(audio) = context.decoder().audio() {
                        info.sample_rate = audio.rate();
                        info.channels = audio.channels();
                    }
                }
                _ => {}
            }
        }
        Some(info)
    }

    fn time_base(&self, index: usize) -> Rational {
        self.time_bases
            .get(index)
            .copied()
            .unwrap_or(Rational(1, TIME_BASE_US as i32))
    }
}

impl Source for FfmpegSource {
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(PlayerError::Aborted);
            }
            let Some((stream, packet)) = self.input.packets().next() else {
                return Ok(None);
            };
            let index = stream.index();
            if !self.streams.iter().any(|s| s.id == index as i32) {
                continue;
            }
            let time_base = self.time_base(index);
            let duration = packet.duration();
            return Ok(Some(DemuxPacket {
                stream_id: index as i32,
                dts: packet.dts().map(|ts| to_us(ts, time_base)),
                pts: packet.pts().map(|ts| to_us(ts, time_base)),
                duration: (duration > 0).then(|| to_us(duration, time_base)),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                pts_offset_correction: 0,
            }));
        }
    }

    fn stream(&self, id: i32) -> Option<StreamInfo> {
        self.streams.iter().find(|s| s.id == id).cloned()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn seek_time(&mut self, time_ms: i64, backward: bool) -> Result<Option<i64>> {
        if !self.caps.seekable {
            return Err(PlayerError::Other("直播流不支持 Seek".to_string()));
        }
        let target = time_ms * 1000;
        let result = if backward {
            self.input.seek(target, ..=target)
        } else {
            self.input.seek(target, target..)
        };
        if let Err(e) = result {
            warn!("{} ⚠️ FFmpeg Seek 到 {}ms 失败: {}", log_ctx(), time_ms, e);
            return Err(e.into());
        }
        // 实际落点要等读到第一个包才知道
        Ok(None)
    }

    fn stream_length(&self) -> i64 {
        self.duration_ms
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.chapters.clone()
    }

    fn caps(&self) -> SourceCaps {
        self.caps
    }

    fn attach_abort(&mut self, abort: Arc<AtomicBool>) {
        self.abort = abort;
    }

    fn description(&self) -> String {
        format!("ffmpeg({})", self.path)
    }
}

/// 外挂字幕文件（FFmpeg 能解析的格式）
pub fn open_subtitle_file(path: PathBuf) -> Result<FfmpegSubtitleSource> {
    let mut inner = FfmpegSource::open(&path.to_string_lossy())?;
    inner.streams.retain(|s| s.stream_type == Some(StreamType::Subtitle));
    for stream in inner.streams.iter_mut() {
        stream.filename = Some(path.clone());
    }
    Ok(FfmpegSubtitleSource { inner })
}

/// 只暴露字幕流、来源标记为外挂字幕的 FFmpeg 数据源
pub struct FfmpegSubtitleSource {
    inner: FfmpegSource,
}

impl Source for FfmpegSubtitleSource {
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        self.inner.read_packet()
    }

    fn stream(&self, id: i32) -> Option<StreamInfo> {
        self.inner.stream(id)
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.inner.streams()
    }

    fn seek_time(&mut self, time_ms: i64, backward: bool) -> Result<Option<i64>> {
        self.inner.seek_time(time_ms, backward)
    }

    fn stream_length(&self) -> i64 {
        self.inner.stream_length()
    }

    fn caps(&self) -> SourceCaps {
        self.inner.caps()
    }

    fn origin(&self) -> crate::core::StreamSource {
        crate::core::StreamSource::DemuxSub
    }

    fn attach_abort(&mut self, abort: Arc<AtomicBool>) {
        self.inner.attach_abort(abort);
    }

    fn description(&self) -> String {
        format!("ffmpeg-sub({})", self.inner.path)
    }
}
