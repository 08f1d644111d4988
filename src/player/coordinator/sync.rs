use crate::core::{msec_to_time, StreamType, SyncSettings};
use crate::player::current_stream::{AvSync, SyncState};

/// 视频比音频晚开始时，音频每 1% 队列水位最多等这么久
const AUDIO_WAIT_PER_LEVEL: i64 = msec_to_time(80);
/// 视频还在 Starting、音频已经停住时，视频超过这么多包就整体重来
const VIDEO_STARTUP_GIVEUP_PACKETS: u64 = 10;

/// 一路音视频流在同步判断里需要的信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncView {
    pub state: SyncState,
    pub avsync: AvSync,
    pub packets: u64,
    pub level: u32,
    pub accepts_data: bool,
    pub stalled: bool,
    pub start_time: Option<i64>,
    pub cache_time: i64,
    pub cache_total: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncInputs {
    pub audio: Option<SyncView>,
    pub video: Option<SyncView>,
    pub realtime: bool,
    /// 数据源已读完：还在 Starting 的流不会再有数据
    pub eof: bool,
    /// 当前时钟，算不出共同起点时使用
    pub clock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Wait,
    /// 只有这一路重新打开过，单独对齐到正在运行的时钟
    ResyncSingle(StreamType),
    /// 所有音视频流一起对齐到这个时钟值
    SyncAll(i64),
    /// 视频一直起不来，清空缓冲重来
    FlushBuffers,
}

fn is_waiting(view: Option<SyncView>) -> bool {
    view.map_or(false, |p| p.state == SyncState::WaitSync)
}

/// `this` 是否可以参与同步（包括几种不再等它的例外）
fn is_ready(
    this: Option<SyncView>,
    other: Option<SyncView>,
    threshold: u64,
    eof: bool,
) -> bool {
    let Some(this) = this else {
        return true;
    };
    let other_packets = other.map_or(0, |o| o.packets);
    let other_refuses = other.map_or(false, |o| !o.accepts_data);

    this.state == SyncState::WaitSync
        || (this.packets == 0 && other_packets > threshold)
        || (other_refuses && this.level < 10)
        || (eof && this.state == SyncState::Starting)
}

/// 同步状态机：在每次主循环里评估一次
pub fn evaluate(inputs: &SyncInputs, settings: &SyncSettings) -> SyncDecision {
    let audio = inputs.audio;
    let video = inputs.video;

    if !is_waiting(audio) && !is_waiting(video) {
        return SyncDecision::Wait;
    }

    let threshold = if inputs.realtime {
        settings.realtime_packet_threshold
    } else {
        settings.startup_packet_threshold
    };

    if let Some(a) = audio {
        if a.state == SyncState::WaitSync && a.avsync == AvSync::Cont {
            return SyncDecision::ResyncSingle(StreamType::Audio);
        }
    }
    if let Some(v) = video {
        if v.state == SyncState::WaitSync && v.avsync == AvSync::Cont {
            return SyncDecision::ResyncSingle(StreamType::Video);
        }
    }

    let video_ready = is_ready(video, audio, threshold, inputs.eof);
    let audio_ready = is_ready(audio, video, threshold, inputs.eof);
    if video_ready && audio_ready {
        let clock = common_clock(audio, video, inputs.realtime, settings).unwrap_or(inputs.clock);
        return SyncDecision::SyncAll(clock);
    }

    if let (Some(a), Some(v)) = (audio, video) {
        if v.state == SyncState::Starting
            && v.packets > VIDEO_STARTUP_GIVEUP_PACKETS
            && !a.accepts_data
            && v.stalled
        {
            return SyncDecision::FlushBuffers;
        }
    }

    SyncDecision::Wait
}

/// 计算共同时钟起点
///
/// 默认用视频的开始时间减去它的总缓冲；有音频时优先用音频（直播源再多留
/// `live_wait_ms`），但不会比视频更晚开始；视频明显晚于音频开始时，
/// 按音频队列水位限制最多等多久。
pub fn common_clock(
    audio: Option<SyncView>,
    video: Option<SyncView>,
    realtime: bool,
    settings: &SyncSettings,
) -> Option<i64> {
    let video = video.filter(|v| v.packets > 0);
    let video_origin = video.and_then(|v| v.start_time.map(|start| start - v.cache_total));

    let Some((a, audio_start)) = audio
        .filter(|a| a.packets > 0)
        .and_then(|a| a.start_time.map(|start| (a, start)))
    else {
        return video_origin;
    };

    let mut clock = if realtime {
        audio_start - a.cache_total - msec_to_time(settings.live_wait_ms)
    } else {
        audio_start - a.cache_time
    };

    if let (Some(v), Some(origin)) = (video, video_origin) {
        if origin < clock {
            clock = origin;
        } else if v.start_time.map_or(false, |video_start| video_start > audio_start) {
            let max_audio_wait = clock + AUDIO_WAIT_PER_LEVEL * a.level as i64;
            clock = origin.min(max_audio_wait);
        }
    }
    Some(clock)
}
