//! 时间戳连续性检查与 Seek 后的起始门限
//!
//! 音视频包在送进管线前先经过 `check_continuity`：大幅跳变要等另一路流确认
//! 后才修正到 `offset_pts`，没确认的包时间戳置为未知，单独一路的毛刺因此
//! 不会移动整个时间线。

use crate::core::{msec_to_time, DemuxPacket, StreamType, SyncSettings};
use crate::player::current_stream::{AvSync, CurrentStreams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// 倒放或时间戳未知，没有检查
    Skipped,
    Continuous,
    /// 跳变已确认，`offset_pts` 增加了这么多
    Corrected(i64),
    /// 跳变还没得到另一路确认，包的时间戳已置为未知
    Unconfirmed,
}

fn other_av(stream_type: StreamType) -> StreamType {
    match stream_type {
        StreamType::Audio => StreamType::Video,
        _ => StreamType::Audio,
    }
}

/// 检查音视频包的时间戳是否连续
///
/// `packet` 已经减去了当前的 `offset_pts`。
pub fn check_continuity(
    streams: &mut CurrentStreams,
    stream_type: StreamType,
    packet: &mut DemuxPacket,
    offset_pts: &mut i64,
    speed: i32,
    settings: &SyncSettings,
) -> Continuity {
    if speed < 0 {
        return Continuity::Skipped;
    }
    let current = streams.get(stream_type);
    let (Some(dts), Some(_)) = (packet.dts, current.dts) else {
        return Continuity::Skipped;
    };

    let audio = streams.audio();
    let video = streams.video();
    let limits = [audio.dts, video.dts, audio.dts_end(), video.dts_end()];
    let max_dts = limits.iter().flatten().copied().max().unwrap_or(dts);

    let mut correction = None;
    if dts > max_dts + msec_to_time(settings.forward_jump_ms) {
        correction = Some(dts - max_dts);
    } else if let Some(dts_end) = current.dts_end() {
        if dts + msec_to_time(settings.backward_jump_ms) < dts_end {
            correction = Some(dts - dts_end);
        }
    }

    let outcome = match correction {
        Some(correction) => {
            let other_last = streams.get(other_av(stream_type)).last_dts;
            let confirmed = !audio.is_active()
                || !video.is_active()
                || current.last_dts.is_none()
                || other_last.map_or(false, |other| {
                    (dts - other).abs() < msec_to_time(settings.agreement_window_ms)
                });
            if confirmed {
                *offset_pts += correction;
                packet.apply_correction(correction);
                Continuity::Corrected(correction)
            } else {
                packet.invalidate_timestamps();
                Continuity::Unconfirmed
            }
        }
        None => Continuity::Continuous,
    };

    let current = streams.get_mut(stream_type);
    if outcome == Continuity::Continuous && current.avsync == AvSync::Check {
        current.avsync = AvSync::Cont;
    }
    // 没确认的包也记下原始 DTS：另一路跳到同一位置时据此确认
    current.last_dts = packet.dts.or(Some(dts));
    outcome
}

/// Seek 后的起始门限，返回 true 表示丢弃这个包
///
/// 目标之前的包全部丢弃；离目标超过 `start_pts_giveup_ms` 时认为流有问题，
/// 把所有设置了门限的流都改到当前位置。
pub fn check_player_init(
    streams: &mut CurrentStreams,
    stream_type: StreamType,
    settings: &SyncSettings,
) -> bool {
    let current = streams.get(stream_type);
    if current.inited {
        return false;
    }

    if let Some(start_pts) = current.start_pts {
        let Some(dts) = current.dts else {
            return true;
        };
        if start_pts - dts > msec_to_time(settings.start_pts_giveup_ms) {
            for stream in streams.iter_mut() {
                if stream.start_pts.is_some() {
                    stream.start_pts = Some(dts);
                }
            }
        }
        let current = streams.get(stream_type);
        if current.start_pts.map_or(false, |start| dts < start) {
            return true;
        }
    }

    let current = streams.get_mut(stream_type);
    if let Some(dts) = current.dts {
        current.inited = true;
        current.start_pts = Some(dts);
    }
    false
}
