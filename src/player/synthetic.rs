use crate::core::{
    msec_to_time, Chapter, DemuxPacket, PlayerError, Result, StreamFlags, StreamInfo, StreamType,
};
use crate::player::source::{Source, SourceCaps};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 合成音频：48kHz 立体声 f32
const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;
const BYTES_PER_FRAME: usize = 8;
/// 视频关键帧间隔
const KEYFRAME_INTERVAL_MS: i64 = 1000;

/// 在某个时刻让后续时间戳整体跳变（模拟直播流切换、拼接文件）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampJump {
    pub at_ms: i64,
    pub offset_ms: i64,
}

/// 合成数据源配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub duration_ms: i64,
    pub video: bool,
    /// 每种语言一条音轨
    pub audio_languages: Vec<String>,
    /// 每种语言一条字幕
    pub subtitle_languages: Vec<String>,
    pub video_frame_ms: i64,
    pub audio_frame_ms: i64,
    pub subtitle_interval_ms: i64,
    pub jump: Option<TimestampJump>,
    /// 从这个时刻起视频格式变化（分辨率翻倍）
    pub format_change_at_ms: Option<i64>,
    /// 按墙钟节奏产生数据，不可 Seek
    pub realtime: bool,
    pub chapters: Vec<Chapter>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            video: true,
            audio_languages: vec!["eng".to_string()],
            subtitle_languages: Vec::new(),
            video_frame_ms: 40,
            audio_frame_ms: 32,
            subtitle_interval_ms: 2000,
            jump: None,
            format_change_at_ms: None,
            realtime: false,
            chapters: Vec::new(),
        }
    }
}

struct SyntheticStream {
    info: StreamInfo,
    interval_ms: i64,
    next_ms: i64,
}

/// 生成音视频 / 字幕数据包的数据源
///
/// 包按时间线交错输出，行为接近真实的解封装器。用于无头演示和测试。
pub struct SyntheticSource {
    config: SyntheticConfig,
    streams: Vec<SyntheticStream>,
    started: Option<Instant>,
    abort: Arc<AtomicBool>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let mut streams = Vec::new();
        let mut next_id = 0;

        if config.video {
            streams.push(SyntheticStream {
                info: StreamInfo {
                    id: next_id,
                    stream_type: Some(StreamType::Video),
                    codec: "h264".to_string(),
                    width: 1280,
                    height: 720,
                    flags: StreamFlags {
                        default: true,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                interval_ms: config.video_frame_ms.max(1),
                next_ms: 0,
            });
            next_id += 1;
        }

        for (index, language) in config.audio_languages.iter().enumerate() {
            streams.push(SyntheticStream {
                info: StreamInfo {
                    id: next_id,
                    stream_type: Some(StreamType::Audio),
                    codec: "pcm_f32le".to_string(),
                    language: language.clone(),
                    channels: CHANNELS,
                    sample_rate: SAMPLE_RATE,
                    flags: StreamFlags {
                        default: index == 0,
                        original: index == 0,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                interval_ms: config.audio_frame_ms.max(1),
                next_ms: 0,
            });
            next_id += 1;
        }

        for language in &config.subtitle_languages {
            streams.push(SyntheticStream {
                info: StreamInfo {
                    id: next_id,
                    stream_type: Some(StreamType::Subtitle),
                    codec: "subrip".to_string(),
                    language: language.clone(),
                    ..Default::default()
                },
                interval_ms: config.subtitle_interval_ms.max(1),
                next_ms: 0,
            });
            next_id += 1;
        }

        Self {
            config,
            streams,
            started: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 时间线位置 → 数据包时间戳（含跳变）
    fn stamp_ms(&self, timeline_ms: i64) -> i64 {
        match self.config.jump {
            Some(jump) if timeline_ms >= jump.at_ms => timeline_ms + jump.offset_ms,
            _ => timeline_ms,
        }
    }

    /// 数据包时间戳 → 时间线位置
    fn timeline_ms(&self, stamp_ms: i64) -> i64 {
        match self.config.jump {
            Some(jump) if stamp_ms >= jump.at_ms + jump.offset_ms => stamp_ms - jump.offset_ms,
            Some(jump) if stamp_ms >= jump.at_ms => jump.at_ms,
            _ => stamp_ms,
        }
    }

    fn packet_data(&self, stream_type: StreamType, index: usize, timeline_ms: i64) -> Vec<u8> {
        match stream_type {
            StreamType::Audio => {
                let frames = (SAMPLE_RATE as i64 * self.streams[index].interval_ms / 1000) as usize;
                vec![0u8; frames * BYTES_PER_FRAME]
            }
            StreamType::Video => {
                let keyframe = timeline_ms % KEYFRAME_INTERVAL_MS < self.streams[index].interval_ms;
                let mut data = vec![0u8; 64];
                data[0] = keyframe as u8;
                data
            }
            _ => format!("#{}", timeline_ms / self.streams[index].interval_ms).into_bytes(),
        }
    }

    /// 实时源：等到墙钟追上时间线
    fn wait_realtime(&mut self, timeline_ms: i64) -> Result<()> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_millis(timeline_ms.max(0) as u64);
        while Instant::now() < due {
            if self.abort.load(Ordering::SeqCst) {
                return Err(PlayerError::Aborted);
            }
            thread::sleep((due - Instant::now()).min(Duration::from_millis(10)));
        }
        Ok(())
    }
}

impl Source for SyntheticSource {
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        let next = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.next_ms < self.config.duration_ms)
            .min_by_key(|(index, s)| (s.next_ms, *index))
            .map(|(index, s)| (index, s.next_ms));
        let Some((index, timeline_ms)) = next else {
            return Ok(None);
        };

        if self.config.realtime {
            self.wait_realtime(timeline_ms)?;
        }

        let stream_type = self.streams[index].info.stream_type.unwrap_or(StreamType::DataService);
        let interval_ms = self.streams[index].interval_ms;
        let data = self.packet_data(stream_type, index, timeline_ms);
        self.streams[index].next_ms += interval_ms;

        let stamp = msec_to_time(self.stamp_ms(timeline_ms));
        Ok(Some(DemuxPacket {
            stream_id: self.streams[index].info.id,
            dts: Some(stamp),
            pts: Some(stamp),
            duration: Some(msec_to_time(interval_ms)),
            data,
            pts_offset_correction: 0,
        }))
    }

    fn stream(&self, id: i32) -> Option<StreamInfo> {
        let stream = self.streams.iter().find(|s| s.info.id == id)?;
        let mut info = stream.info.clone();
        if let Some(change_at) = self.config.format_change_at_ms {
            if info.stream_type == Some(StreamType::Video) && stream.next_ms > change_at {
                info.changes = 1;
                info.width *= 2;
                info.height *= 2;
            }
        }
        Some(info)
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter_map(|s| self.stream(s.info.id))
            .collect()
    }

    fn seek_time(&mut self, time_ms: i64, backward: bool) -> Result<Option<i64>> {
        if self.config.realtime {
            return Err(PlayerError::Other("实时源不支持 Seek".to_string()));
        }
        let target = self.timeline_ms(time_ms).clamp(0, self.config.duration_ms);
        // 视频只能从关键帧开始
        let landing = if self.config.video {
            let floor = target - target % KEYFRAME_INTERVAL_MS;
            if backward || floor == target {
                floor
            } else {
                (floor + KEYFRAME_INTERVAL_MS).min(self.config.duration_ms)
            }
        } else {
            target
        };
        for stream in self.streams.iter_mut() {
            stream.next_ms = landing - landing % stream.interval_ms;
        }
        debug!("⏩ 合成数据源 Seek: {}ms → {}ms", time_ms, landing);
        Ok(Some(msec_to_time(self.stamp_ms(landing))))
    }

    fn stream_length(&self) -> i64 {
        self.config.duration_ms
    }

    fn chapters(&self) -> Vec<Chapter> {
        self.config.chapters.clone()
    }

    fn caps(&self) -> SourceCaps {
        SourceCaps {
            seekable: !self.config.realtime,
            pausable: !self.config.realtime,
            realtime: self.config.realtime,
            menu: false,
        }
    }

    fn attach_abort(&mut self, abort: Arc<AtomicBool>) {
        self.abort = abort;
    }

    fn description(&self) -> String {
        format!(
            "synthetic({}ms, {} 条流{})",
            self.config.duration_ms,
            self.streams.len(),
            if self.config.realtime { ", 实时" } else { "" }
        )
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        info!("🔌 关闭数据源: {}", self.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(source: &mut SyntheticSource) -> Vec<DemuxPacket> {
        let mut packets = Vec::new();
        while let Some(packet) = source.read_packet().unwrap() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_packets_are_interleaved_by_time() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            duration_ms: 200,
            ..Default::default()
        });
        let packets = read_all(&mut source);
        let dts: Vec<i64> = packets.iter().map(|p| p.dts.unwrap()).collect();
        let mut sorted = dts.clone();
        sorted.sort();
        assert_eq!(dts, sorted);

        let video = packets.iter().filter(|p| p.stream_id == 0).count();
        let audio = packets.iter().filter(|p| p.stream_id == 1).count();
        assert_eq!(video, 5);
        assert_eq!(audio, 7);
        // 32ms @ 48kHz 立体声 f32
        assert_eq!(packets.iter().find(|p| p.stream_id == 1).unwrap().data.len(), 1536 * 8);
    }

    #[test]
    fn test_timestamp_jump() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            duration_ms: 200,
            audio_languages: Vec::new(),
            jump: Some(TimestampJump { at_ms: 80, offset_ms: 5000 }),
            ..Default::default()
        });
        let dts: Vec<i64> = read_all(&mut source).iter().map(|p| p.dts.unwrap() / 1000).collect();
        assert_eq!(dts, vec![0, 40, 5080, 5120, 5160]);
    }

    #[test]
    fn test_seek_lands_on_keyframe() {
        let mut source = SyntheticSource::new(SyntheticConfig::default());
        assert_eq!(source.seek_time(2500, true).unwrap(), Some(msec_to_time(2000)));
        let first_video = std::iter::from_fn(|| source.read_packet().unwrap())
            .find(|p| p.stream_id == 0)
            .unwrap();
        assert_eq!(first_video.dts, Some(msec_to_time(2000)));
        assert_eq!(source.seek_time(2500, false).unwrap(), Some(msec_to_time(3000)));
    }

    #[test]
    fn test_format_change_bumps_counter() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            format_change_at_ms: Some(100),
            audio_languages: Vec::new(),
            ..Default::default()
        });
        assert_eq!(source.stream(0).unwrap().changes, 0);
        for _ in 0..4 {
            source.read_packet().unwrap();
        }
        let info = source.stream(0).unwrap();
        assert_eq!(info.changes, 1);
        assert_eq!(info.width, 2560);
    }

    #[test]
    fn test_realtime_source_is_not_seekable() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            realtime: true,
            ..Default::default()
        });
        assert!(source.caps().realtime);
        assert!(!source.caps().seekable);
        assert!(source.seek_time(1000, false).is_err());
    }
}
