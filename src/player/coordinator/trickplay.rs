use crate::core::{
    msec_to_time, sec_to_time, time_to_msec, SeekRequest, SyncSettings, PLAYSPEED_NORMAL,
    PLAYSPEED_PAUSE,
};

/// 快进快退时的时钟跟踪
///
/// 非正常速度下视频管线只能挑关键帧输出；时钟跑得比视频快（或倒放时慢）
/// 超过允许误差时，向时钟前方一秒发一个非精确 Seek。
#[derive(Debug, Clone, Default)]
pub struct TrickplayState {
    /// 视频管线最近呈现的时间戳
    last_pts: Option<i64>,
    /// 上一次发起 Seek 时的时钟
    last_seek_clock: Option<i64>,
}

impl TrickplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush / Seek 之后从给定位置重新开始
    pub fn reset(&mut self, pts: Option<i64>) {
        self.last_pts = pts;
        self.last_seek_clock = pts;
    }

    pub fn last_pts(&self) -> Option<i64> {
        self.last_pts
    }

    /// 检查一次；需要跳转时返回 Seek 请求（时间是带偏移的源时间）
    pub fn check(
        &mut self,
        clock: i64,
        video_pts: Option<i64>,
        speed: i32,
        offset_pts: i64,
        settings: &SyncSettings,
    ) -> Option<SeekRequest> {
        if speed == PLAYSPEED_NORMAL || speed == PLAYSPEED_PAUSE {
            return None;
        }
        if video_pts.is_some() {
            self.last_pts = video_pts;
        }
        let last_pts = self.last_pts?;

        let direction: i64 = if speed > 0 { 1 } else { -1 };
        let mut error = ((clock - last_pts) * direction) as f64;
        if speed > PLAYSPEED_NORMAL {
            let widening = (speed as f64 / PLAYSPEED_NORMAL as f64).min(settings.trickplay_max_widening);
            error /= widening;
        }
        if error <= msec_to_time(settings.trickplay_error_ms) as f64 {
            return None;
        }

        let since_last_seek = self.last_seek_clock.map_or(i64::MAX, |c| (clock - c).abs());
        if since_last_seek <= sec_to_time(1) {
            return None;
        }
        self.last_seek_clock = Some(clock);

        let target = clock + offset_pts + sec_to_time(1) * direction;
        Some(SeekRequest {
            time_ms: time_to_msec(target),
            relative: false,
            backward: speed < 0,
            accurate: false,
            restore: false,
            trickplay: true,
            sync: false,
        })
    }
}
