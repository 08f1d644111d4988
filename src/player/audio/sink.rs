use crate::core::{DemuxPacket, PlayerError, Result, StreamInfo, PLAYSPEED_PAUSE};
use crate::player::audio::delay::{DelayEstimator, DelayMode, DeviceReading};
use crate::player::log_ctx;
use crate::player::pipeline::EventSender;
use crate::player::pipeline_thread::{Consumed, ConsumerFactory, PacketConsumer};
use crossbeam::utils::Backoff;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

/// 设备一直不收数据时放弃写入的时间
const STALL_GIVEUP: Duration = Duration::from_secs(1);

/// 采样编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleEncoding {
    PcmS16,
    PcmF32,
    /// 压缩码流直通（AC3 / DTS 等），帧计数不可靠
    Passthrough,
}

impl SampleEncoding {
    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            SampleEncoding::PcmS16 | SampleEncoding::Passthrough => 2,
            SampleEncoding::PcmF32 => 4,
        }
    }
}

/// 音频输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    /// 由流信息推算请求的格式（直通按编码名判断）
    pub fn from_stream(info: &StreamInfo) -> Self {
        let passthrough = matches!(
            info.codec.as_str(),
            "ac3" | "eac3" | "dca" | "dtshd_ma" | "dtshd_hra" | "truehd"
        );
        Self {
            sample_rate: if info.sample_rate > 0 { info.sample_rate } else { 48_000 },
            channels: if info.channels > 0 { info.channels } else { 2 },
            encoding: if passthrough {
                SampleEncoding::Passthrough
            } else {
                SampleEncoding::PcmF32
            },
        }
    }

    /// 一帧（所有声道各一个采样）的字节数
    pub fn frame_size(&self) -> u32 {
        self.channels as u32 * self.encoding.bytes_per_sample()
    }

    pub fn bytes_per_sec(&self) -> u32 {
        self.frame_size() * self.sample_rate
    }

    pub fn frames_to_time(&self, frames: u64) -> i64 {
        (frames as i64 * 1_000_000) / self.sample_rate.max(1) as i64
    }
}

/// 设备能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rates: Vec<u32>,
    pub channel_counts: Vec<u16>,
    pub encodings: Vec<SampleEncoding>,
}

impl DeviceInfo {
    pub fn supports(&self, format: &AudioFormat) -> bool {
        self.sample_rates.contains(&format.sample_rate)
            && self.channel_counts.contains(&format.channels)
            && self.encodings.contains(&format.encoding)
    }
}

/// 音频设备抽象
pub trait AudioDevice: Send {
    fn info(&self) -> DeviceInfo;

    /// 以协商好的格式打开设备
    fn open(&mut self, format: &AudioFormat) -> Result<()>;

    /// 写入数据，返回设备接收的帧数（缓冲满时为 0）
    fn write(&mut self, data: &[u8], frames: u32) -> Result<u32>;

    /// 32 位回绕的硬件播放头（帧）
    fn head_position(&mut self) -> u32;

    /// (当前时间, 呈现时间戳)，微秒；设备不支持时为 None
    fn timestamp(&mut self) -> Option<(i64, i64)> {
        None
    }

    /// 设备缓冲容量（帧）
    fn buffer_frames(&self) -> u32;

    fn play(&mut self);

    fn pause(&mut self);

    /// 丢弃设备中未播放的数据
    fn flush(&mut self);

    fn close(&mut self);
}

/// 音频输出端：格式协商、带退避的写入、延迟估计
pub struct AudioSink<D: AudioDevice> {
    device: D,
    format: Option<AudioFormat>,
    estimator: Option<DelayEstimator>,
    paused: bool,
    stall_giveup: Duration,
}

impl<D: AudioDevice> AudioSink<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            format: None,
            estimator: None,
            paused: false,
            stall_giveup: STALL_GIVEUP,
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.info()
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// 打开设备，返回实际使用的格式（不支持时自动回退）
    pub fn initialize(&mut self, requested: &AudioFormat) -> Result<AudioFormat> {
        let info = self.device.info();
        let format = Self::negotiate(requested, &info)?;
        if format != *requested {
            warn!(
                "⚠️  音频设备不支持 {} Hz, {} 声道 {:?}，回退到 {} Hz, {} 声道 {:?}",
                requested.sample_rate,
                requested.channels,
                requested.encoding,
                format.sample_rate,
                format.channels,
                format.encoding
            );
        }

        self.device.open(&format)?;
        let mode = match format.encoding {
            SampleEncoding::Passthrough => DelayMode::Timestamp,
            _ => DelayMode::FramePosition,
        };
        self.estimator = Some(DelayEstimator::new(
            mode,
            format.frame_size(),
            format.bytes_per_sec(),
        ));
        self.format = Some(format);
        info!(
            "{} 🔊 音频输出已初始化: {} ({} Hz, {} 声道, {:?})",
            log_ctx(),
            info.name,
            format.sample_rate,
            format.channels,
            format.encoding
        );

        self.paused = false;
        self.start_playing();
        Ok(format)
    }

    fn negotiate(requested: &AudioFormat, info: &DeviceInfo) -> Result<AudioFormat> {
        if info.supports(requested) {
            return Ok(*requested);
        }

        // 直通不支持时先按同样的采样率/声道退回 PCM
        let pcm = AudioFormat {
            encoding: SampleEncoding::PcmF32,
            ..*requested
        };
        if info.supports(&pcm) {
            return Ok(pcm);
        }

        let fallback_configs = [
            (48000, 2), // 最常见
            (44100, 2), // CD 音质
            (48000, 1),
            (44100, 1),
        ];
        for encoding in [SampleEncoding::PcmF32, SampleEncoding::PcmS16] {
            for (sample_rate, channels) in fallback_configs {
                let candidate = AudioFormat {
                    sample_rate,
                    channels,
                    encoding,
                };
                if info.supports(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            requested.sample_rate, requested.channels
        )))
    }

    fn start_playing(&mut self) {
        self.device.play();
        let head = self.device.head_position();
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.extend_head(head);
            estimator.set_playing(true);
        }
    }

    /// 写入 `frames` 帧；设备满时退避重试，直到写完或超过放弃时间
    pub fn add_packets(&mut self, data: &[u8], frames: u32) -> Result<u32> {
        let format = self
            .format
            .ok_or_else(|| PlayerError::AudioError("音频输出未初始化".to_string()))?;
        let frame_size = format.frame_size() as usize;
        let frames = frames.min((data.len() / frame_size.max(1)) as u32);

        let backoff = Backoff::new();
        let mut consumed: u32 = 0;
        let mut stalled_since: Option<Instant> = None;

        while consumed < frames {
            let offset = consumed as usize * frame_size;
            let written = self.device.write(&data[offset..], frames - consumed)?;
            if written > 0 {
                consumed += written;
                if let Some(estimator) = self.estimator.as_mut() {
                    estimator.add_written_frames(written);
                }
                backoff.reset();
                stalled_since = None;
                continue;
            }

            if self.paused {
                // 暂停时设备不会消费，留给调用方稍后重试
                break;
            }

            let since = *stalled_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.stall_giveup {
                warn!(
                    "{} ⚠️ 音频设备 {:?} 内未接收数据，放弃剩余 {} 帧",
                    log_ctx(),
                    self.stall_giveup,
                    frames - consumed
                );
                break;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
        Ok(consumed)
    }

    /// 尚未播放出去的时长（秒）
    pub fn delay(&mut self) -> f64 {
        let now = Instant::now();
        let Some(estimator) = self.estimator.as_mut() else {
            return 0.0;
        };
        let reading = match estimator.mode() {
            DelayMode::FramePosition => Some(DeviceReading::HeadPosition(self.device.head_position())),
            DelayMode::Timestamp => self
                .device
                .timestamp()
                .map(|(now_us, presented_us)| DeviceReading::Timestamp { now_us, presented_us }),
        };
        match reading {
            Some(reading) => estimator.measure(reading, now),
            None => estimator.delay(now),
        }
    }

    /// 设备缓冲总时长（秒）
    pub fn cache_total(&self) -> f64 {
        match self.format {
            Some(format) => self.device.buffer_frames() as f64 / format.sample_rate.max(1) as f64,
            None => 0.0,
        }
    }

    /// 注入一段不阻塞的静音（同步调整用）
    pub fn add_pause(&mut self, length: Duration) {
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.inject_fake_pause(length, Instant::now());
        }
    }

    /// 等设备把缓冲播放完
    pub fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.delay()) + STALL_GIVEUP;
        while !self.paused && self.delay() > 0.001 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        debug!("{} 🔚 音频输出 drain 完成", log_ctx());
        self.reset_estimator();
    }

    pub fn flush(&mut self) {
        self.device.flush();
        self.reset_estimator();
    }

    fn reset_estimator(&mut self) {
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.reset();
        }
        if !self.paused {
            self.start_playing();
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            self.device.pause();
            if let Some(estimator) = self.estimator.as_mut() {
                estimator.set_playing(false);
            }
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.start_playing();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn stop(&mut self) {
        self.device.close();
        if let Some(estimator) = self.estimator.as_mut() {
            estimator.reset();
        }
        self.format = None;
    }
}

/// 无声设备：按墙上时钟模拟消费，播放头为 32 位回绕计数
pub struct NullAudioDevice {
    format: Option<AudioFormat>,
    buffer_frames: u32,
    written_frames: u64,
    played_frames: u64,
    playing_since: Option<Instant>,
    head_start: u32,
    epoch: Instant,
}

impl NullAudioDevice {
    pub fn new() -> Self {
        Self::with_head_start(0)
    }

    /// 播放头从指定值开始计数（可用于验证回绕）
    pub fn with_head_start(head_start: u32) -> Self {
        Self {
            format: None,
            buffer_frames: 0,
            written_frames: 0,
            played_frames: 0,
            playing_since: None,
            head_start,
            epoch: Instant::now(),
        }
    }

    fn refresh(&mut self) {
        let (Some(format), Some(since)) = (self.format, self.playing_since) else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(since).as_secs_f64();
        let advanced = (elapsed * format.sample_rate as f64) as u64;
        if advanced > 0 {
            self.played_frames = (self.played_frames + advanced).min(self.written_frames);
            self.playing_since = Some(now);
        }
    }

    fn queued_frames(&self) -> u64 {
        self.written_frames - self.played_frames
    }
}

impl Default for NullAudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for NullAudioDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "null".to_string(),
            sample_rates: vec![44100, 48000, 96000],
            channel_counts: vec![1, 2, 6, 8],
            encodings: vec![
                SampleEncoding::PcmS16,
                SampleEncoding::PcmF32,
                SampleEncoding::Passthrough,
            ],
        }
    }

    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        self.format = Some(*format);
        // 设备缓冲 0.5 秒
        self.buffer_frames = format.sample_rate / 2;
        self.written_frames = 0;
        self.played_frames = 0;
        Ok(())
    }

    fn write(&mut self, _data: &[u8], frames: u32) -> Result<u32> {
        if self.format.is_none() {
            return Err(PlayerError::AudioError("设备未打开".to_string()));
        }
        self.refresh();
        let free = (self.buffer_frames as u64).saturating_sub(self.queued_frames());
        let accepted = (frames as u64).min(free) as u32;
        self.written_frames += accepted as u64;
        Ok(accepted)
    }

    fn head_position(&mut self) -> u32 {
        self.refresh();
        self.head_start.wrapping_add(self.played_frames as u32)
    }

    fn timestamp(&mut self) -> Option<(i64, i64)> {
        let format = self.format?;
        if format.encoding != SampleEncoding::Passthrough {
            return None;
        }
        self.refresh();
        let now_us = self.epoch.elapsed().as_micros() as i64;
        Some((now_us, now_us - format.frames_to_time(self.queued_frames())))
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn play(&mut self) {
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
    }

    fn pause(&mut self) {
        self.refresh();
        self.playing_since = None;
    }

    fn flush(&mut self) {
        self.refresh();
        self.written_frames = self.played_frames;
    }

    fn close(&mut self) {
        self.format = None;
        self.playing_since = None;
    }
}

/// 把音频管线的数据包写进 AudioSink
pub struct AudioSinkConsumer<D: AudioDevice> {
    sink: AudioSink<D>,
    format: AudioFormat,
    muted: bool,
    /// 最后写入数据的结束时间戳
    last_end_pts: Option<i64>,
    /// 当前包已经写进设备的帧数（上次没写完时非 0）
    written_frames: u32,
}

impl<D: AudioDevice + 'static> AudioSinkConsumer<D> {
    pub fn open(device: D, hint: &StreamInfo) -> Result<Self> {
        let mut sink = AudioSink::new(device);
        let device_info = sink.device_info();
        debug!(
            "{} 🔈 音频设备 {}: 采样率 {:?} 声道 {:?}",
            log_ctx(),
            device_info.name,
            device_info.sample_rates,
            device_info.channel_counts
        );
        let format = sink.initialize(&AudioFormat::from_stream(hint))?;
        Ok(Self {
            sink,
            format,
            muted: false,
            last_end_pts: None,
            written_frames: 0,
        })
    }

    /// 每次打开流都用 `make_device` 新建设备
    pub fn factory<F>(mut make_device: F) -> ConsumerFactory
    where
        F: FnMut() -> Result<D> + Send + 'static,
    {
        Box::new(move |hint: &StreamInfo| {
            let device = make_device()?;
            Ok(Box::new(AudioSinkConsumer::open(device, hint)?) as Box<dyn PacketConsumer>)
        })
    }
}

impl<D: AudioDevice> PacketConsumer for AudioSinkConsumer<D> {
    fn consume(&mut self, packet: &DemuxPacket, drop: bool, _events: &EventSender) -> Result<Consumed> {
        if drop {
            return Ok(Consumed::Done);
        }
        let frame_size = self.format.frame_size() as usize;
        let frames = (packet.data.len() / frame_size.max(1)) as u32;
        let start = self.written_frames.min(frames);
        let offset = start as usize * frame_size;
        let written = if self.muted {
            let silence = vec![0u8; packet.data.len() - offset];
            self.sink.add_packets(&silence, frames - start)?
        } else {
            self.sink.add_packets(&packet.data[offset..], frames - start)?
        };
        let done = start + written;

        // 结束时间戳只算到真正写进设备的部分
        if let Some(pts) = packet.pts.or(packet.dts) {
            let end = if done >= frames {
                pts + packet
                    .duration
                    .unwrap_or_else(|| self.format.frames_to_time(frames as u64))
            } else {
                pts + self.format.frames_to_time(done as u64)
            };
            self.last_end_pts = Some(end);
        }

        if done < frames {
            debug!("{} 🔇 音频包只写入 {}/{} 帧，稍后继续", log_ctx(), done, frames);
            self.written_frames = done;
            return Ok(Consumed::Retry);
        }
        self.written_frames = 0;
        Ok(Consumed::Done)
    }

    fn flush(&mut self) {
        self.sink.flush();
        self.last_end_pts = None;
        self.written_frames = 0;
    }

    fn reset(&mut self) {
        self.flush();
    }

    fn set_mute(&mut self, mute: bool) {
        self.muted = mute;
    }

    fn set_speed(&mut self, speed: i32) {
        if speed == PLAYSPEED_PAUSE {
            self.sink.pause();
        } else {
            self.sink.resume();
        }
    }

    fn cache_time(&mut self) -> i64 {
        (self.sink.delay() * 1_000_000.0) as i64
    }

    fn cache_total(&self) -> i64 {
        (self.sink.cache_total() * 1_000_000.0) as i64
    }

    fn lead_time(&self) -> i64 {
        self.cache_total()
    }

    fn presented_pts(&mut self, last_pts: i64) -> i64 {
        let end = self.last_end_pts.unwrap_or(last_pts);
        end - self.cache_time()
    }

    fn drain(&mut self) {
        self.sink.drain();
    }

    fn close(&mut self) {
        self.sink.stop();
    }
}
