use crate::core::{PLAYSPEED_NORMAL, PLAYSPEED_PAUSE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// 共享播放时钟 - 所有输出管线与协调器共用的时间源
///
/// - 单调、可暂停、可变速
/// - 支持不连续跳转（Seek / 同步后重设原点）
/// - 直播源额外有一个细粒度的速度微调项
///
/// 克隆得到的是同一个时钟的句柄；只有协调器线程修改它，其余线程只读。
#[derive(Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_time: i64,        // 基准时钟值（微秒）
    base_instant: Instant, // 基准时刻
    speed: i32,            // 播放速度（千分比）
    speed_adjust: f64,     // 直播速度微调（-0.05 = 慢 5%）
    paused: bool,
    epoch: Instant,        // 绝对时钟起点
}

impl ClockInner {
    fn clock_at(&self, at: Instant) -> i64 {
        if self.paused || self.speed == PLAYSPEED_PAUSE {
            return self.base_time;
        }
        let elapsed = at.saturating_duration_since(self.base_instant).as_micros() as f64;
        let rate = self.speed as f64 / PLAYSPEED_NORMAL as f64 * (1.0 + self.speed_adjust);
        self.base_time + (elapsed * rate) as i64
    }

    /// 以当前值为新的基准，之后再改速度不会让时钟跳变
    fn rebase(&mut self, at: Instant) {
        self.base_time = self.clock_at(at);
        self.base_instant = at;
    }
}

impl SharedClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_time: 0,
                base_instant: now,
                speed: PLAYSPEED_NORMAL,
                speed_adjust: 0.0,
                paused: false,
                epoch: now,
            })),
        }
    }

    /// 当前时钟值（微秒）
    pub fn now(&self) -> i64 {
        self.clock_at(Instant::now())
    }

    pub(crate) fn clock_at(&self, at: Instant) -> i64 {
        self.inner.lock().clock_at(at)
    }

    /// 绝对时钟（微秒），不受暂停与速度影响
    pub fn absolute(&self) -> i64 {
        self.inner.lock().epoch.elapsed().as_micros() as i64
    }

    /// 不连续跳转：时钟立即变为 `clock`
    pub fn discontinuity(&self, clock: i64) {
        self.discontinuity_at(clock, Instant::now());
    }

    pub(crate) fn discontinuity_at(&self, clock: i64, at: Instant) {
        let mut inner = self.inner.lock();
        inner.base_time = clock;
        inner.base_instant = at;
    }

    /// 设置播放速度（千分比，0 = 暂停）
    pub fn set_speed(&self, speed: i32) {
        let mut inner = self.inner.lock();
        if inner.speed != speed {
            inner.rebase(Instant::now());
            inner.speed = speed;
        }
    }

    pub fn speed(&self) -> i32 {
        self.inner.lock().speed
    }

    /// 暂停 / 恢复（与速度无关的独立开关）
    pub fn pause(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.paused != paused {
            inner.rebase(Instant::now());
            inner.paused = paused;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 直播源速度微调
    pub fn set_speed_adjust(&self, adjust: f64) {
        let mut inner = self.inner.lock();
        if inner.speed_adjust != adjust {
            inner.rebase(Instant::now());
            inner.speed_adjust = adjust;
        }
    }

    pub fn speed_adjust(&self) -> f64 {
        self.inner.lock().speed_adjust
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new()
    }
}
