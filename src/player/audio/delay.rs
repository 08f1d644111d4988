use crate::player::audio::smoother::DelaySmoother;
use log::{debug, warn};
use std::time::{Duration, Instant};

/// 延迟测量方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    /// 硬件播放头位置（PCM 与打包直通）
    FramePosition,
    /// 设备呈现时间戳（直通码流时帧计数不可靠）
    Timestamp,
}

/// 设备提供的一次原始读数
#[derive(Debug, Clone, Copy)]
pub enum DeviceReading {
    /// 32 位回绕的播放头（帧）
    HeadPosition(u32),
    /// 当前时间与设备呈现时间戳（同一时间基，微秒）
    Timestamp { now_us: i64, presented_us: i64 },
}

struct FakePause {
    length: Duration,
    since: Instant,
}

/// 输出延迟估计器
///
/// 测量已写入但还没真正播放出去的音频时长（秒），经平滑后供时钟校正使用。
/// 只由音频输出线程持有。
pub struct DelayEstimator {
    mode: DelayMode,
    frame_size: u64,
    bytes_per_sec: f64,
    /// 64 位扩展后的播放头
    head_pos: u64,
    /// 第一次进入播放状态时的播放头
    zero_offset: Option<u64>,
    playing: bool,
    written_bytes: u64,
    smoother: DelaySmoother,
    fake_pause: Option<FakePause>,
}

impl DelayEstimator {
    pub fn new(mode: DelayMode, frame_size: u32, bytes_per_sec: u32) -> Self {
        Self {
            mode,
            frame_size: frame_size.max(1) as u64,
            bytes_per_sec: bytes_per_sec.max(1) as f64,
            head_pos: 0,
            zero_offset: None,
            playing: false,
            written_bytes: 0,
            smoother: DelaySmoother::new(),
            fake_pause: None,
        }
    }

    pub fn mode(&self) -> DelayMode {
        self.mode
    }

    /// 用新的 32 位读数扩展播放头
    ///
    /// 两次读数之间最多回绕一次。
    pub fn extend_head(&mut self, raw: u32) -> u64 {
        if (self.head_pos & 0xFFFF_FFFF) > raw as u64 {
            self.head_pos += 1u64 << 32;
        }
        self.head_pos = (self.head_pos & 0xFFFF_FFFF_0000_0000) | raw as u64;
        self.head_pos
    }

    pub fn head_position(&self) -> u64 {
        self.head_pos
    }

    /// 播放状态变化；第一次进入播放时记录零点
    pub fn set_playing(&mut self, playing: bool) {
        if playing && !self.playing && self.zero_offset.is_none() {
            debug!("🎯 延迟估计零点: {}", self.head_pos);
            self.zero_offset = Some(self.head_pos);
        }
        self.playing = playing;
    }

    pub fn add_written_frames(&mut self, frames: u32) {
        self.written_bytes += frames as u64 * self.frame_size;
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    /// 注入一段"假暂停"（同步用的静音），期间延迟报告为剩余静音时长
    pub fn inject_fake_pause(&mut self, length: Duration, at: Instant) {
        self.fake_pause = Some(FakePause { length, since: at });
    }

    /// 处理一次设备读数，返回平滑后的延迟（秒）
    pub fn measure(&mut self, reading: DeviceReading, at: Instant) -> f64 {
        if let Some(remaining) = self.fake_pause_remaining(at) {
            return remaining;
        }

        let raw = match (self.mode, reading) {
            (DelayMode::FramePosition, DeviceReading::HeadPosition(head)) => {
                self.extend_head(head);
                self.frame_position_delay()
            }
            (DelayMode::Timestamp, DeviceReading::Timestamp { now_us, presented_us }) => {
                ((now_us - presented_us).max(0)) as f64 / 1_000_000.0
            }
            (mode, reading) => {
                warn!("⚠️ 延迟读数与测量方式不匹配: {:?} / {:?}", mode, reading);
                return self.smoother.value();
            }
        };
        self.smoother.add(raw)
    }

    /// 当前延迟（秒）：假暂停优先，否则为最近一次平滑值
    pub fn delay(&mut self, at: Instant) -> f64 {
        self.fake_pause_remaining(at)
            .unwrap_or_else(|| self.smoother.value())
    }

    fn fake_pause_remaining(&mut self, at: Instant) -> Option<f64> {
        let pause = self.fake_pause.as_ref()?;
        let elapsed = at.saturating_duration_since(pause.since);
        if elapsed >= pause.length {
            self.fake_pause = None;
            return None;
        }
        Some((pause.length - elapsed).as_secs_f64())
    }

    fn frame_position_delay(&self) -> f64 {
        let offset = self.zero_offset.unwrap_or(self.head_pos);
        let played_bytes = self.head_pos.saturating_sub(offset) * self.frame_size;
        if played_bytes > self.written_bytes {
            warn!(
                "⚠️ 播放头超过已写入数据（played {} > written {}），延迟按 0 处理",
                played_bytes, self.written_bytes
            );
            return 0.0;
        }
        (self.written_bytes - played_bytes) as f64 / self.bytes_per_sec
    }

    /// 重新初始化 / drain / 停止时清空
    pub fn reset(&mut self) {
        self.head_pos = 0;
        self.zero_offset = None;
        self.playing = false;
        self.written_bytes = 0;
        self.smoother.clear();
        self.fake_pause = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_wrap_extension() {
        let mut estimator = DelayEstimator::new(DelayMode::FramePosition, 4, 192_000);
        let extended: Vec<u64> = [100u32, 200, 50, 150]
            .iter()
            .map(|raw| estimator.extend_head(*raw))
            .collect();
        assert_eq!(extended, vec![100, 200, 4_294_967_346, 4_294_967_446]);
    }

    #[test]
    fn test_head_is_monotonic() {
        let mut estimator = DelayEstimator::new(DelayMode::FramePosition, 4, 192_000);
        // 每步前进不超过 2^32，因此最多回绕一次
        let mut raw: u32 = 0xFFFF_0000;
        let mut previous = estimator.extend_head(raw);
        for step in [1u32, 0x1_0000, 0x7FFF_FFFF, 0, 0xFFFF_FFFF, 12345, 0x8000_0000] {
            raw = raw.wrapping_add(step);
            let current = estimator.extend_head(raw);
            assert!(current >= previous, "{} < {}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_frame_position_delay() {
        // 48kHz 立体声 16 位：4 字节/帧
        let mut estimator = DelayEstimator::new(DelayMode::FramePosition, 4, 192_000);
        let now = Instant::now();
        estimator.extend_head(1000);
        estimator.set_playing(true);
        estimator.add_written_frames(48_000);

        // 播放了 24000 帧，剩下 0.5 秒
        let delay = estimator.measure(DeviceReading::HeadPosition(25_000), now);
        assert!((delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_overrun_clamps_to_zero() {
        let mut estimator = DelayEstimator::new(DelayMode::FramePosition, 4, 192_000);
        estimator.set_playing(true);
        estimator.add_written_frames(100);
        let delay = estimator.measure(DeviceReading::HeadPosition(5000), Instant::now());
        assert_eq!(delay, 0.0);
    }

    #[test]
    fn test_timestamp_mode() {
        let mut estimator = DelayEstimator::new(DelayMode::Timestamp, 4, 192_000);
        let delay = estimator.measure(
            DeviceReading::Timestamp {
                now_us: 2_300_000,
                presented_us: 2_000_000,
            },
            Instant::now(),
        );
        assert!((delay - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_fake_pause_overrides_and_expires() {
        let mut estimator = DelayEstimator::new(DelayMode::FramePosition, 4, 192_000);
        let start = Instant::now();
        estimator.inject_fake_pause(Duration::from_millis(400), start);

        let remaining = estimator.delay(start + Duration::from_millis(100));
        assert!((remaining - 0.3).abs() < 1e-6);

        assert_eq!(estimator.delay(start + Duration::from_millis(500)), 0.0);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut estimator = DelayEstimator::new(DelayMode::Timestamp, 4, 192_000);
        estimator.measure(
            DeviceReading::Timestamp {
                now_us: 1_000_000,
                presented_us: 0,
            },
            Instant::now(),
        );
        estimator.reset();
        assert_eq!(estimator.delay(Instant::now()), 0.0);
        assert_eq!(estimator.written_bytes(), 0);
    }
}
