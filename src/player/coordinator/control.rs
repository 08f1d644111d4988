//! Seek、速度、缓冲与同步控制

use super::caching::{next_state, CachingInputs, CachingView, CachingState};
use super::messages::Command;
use super::sync::{evaluate, SyncDecision, SyncInputs, SyncView};
use super::Coordinator;
use crate::core::{
    msec_to_time, time_to_msec, SeekRequest, StreamType, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE,
};
use crate::player::current_stream::{AvSync, SyncState};
use crate::player::edl::EdlAction;
use crate::player::log_ctx;
use crate::player::pipeline::{PipelineEvent, PipelineMessage};
use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

const AV_TYPES: [StreamType; 2] = [StreamType::Audio, StreamType::Video];
/// 等同步屏障时每次最多阻塞这么久，之间检查中止标志
const SYNCHRONIZE_SLICE: Duration = Duration::from_millis(50);
/// 直播源音频水位过低时把时钟放慢 5%
const LIVE_SLOWDOWN: f64 = -0.05;

impl Coordinator {
    // ---------------------------------------------------------------
    // Seek
    // ---------------------------------------------------------------

    pub(super) fn handle_seek(&mut self, request: SeekRequest) {
        if !self.caps.seekable {
            warn!("{} ⚠️ 数据源不支持 Seek，忽略", log_ctx());
            return;
        }

        let mut time_ms = request.time_ms;
        if request.relative {
            time_ms += self.display_time_ms(self.shared.clock.now());
        }
        if request.restore && self.settings.edl.skip_cuts {
            time_ms = self.edl.restore_cut_time(time_ms);
        }
        let time_ms = time_ms.max(0);

        if request.trickplay {
            debug!("{} ⏩ 快进快退 Seek: {}ms", log_ctx(), time_ms);
        } else {
            info!(
                "{} 🎯 Seek 到 {}ms（accurate={} sync={}）",
                log_ctx(),
                time_ms,
                request.accurate,
                request.sync
            );
        }

        let result = self.source.seek_time(time_ms, request.backward);
        if let Some(sidecar) = self.sidecar.as_mut() {
            sidecar.pending = None;
            sidecar.eof = false;
            if let Err(e) = sidecar.source.seek_time(time_ms, request.backward) {
                debug!("{} 外挂字幕 Seek 失败: {}", log_ctx(), e);
            }
        }

        match result {
            Ok(landed) => {
                let start = landed.unwrap_or_else(|| msec_to_time(time_ms)) - self.offset_pts;
                self.eof = false;
                self.eof_sent.clear();
                self.drained.clear();
                self.flush_buffers(Some(start), request.accurate, request.sync);
            }
            Err(e) => {
                warn!("{} ⚠️ Seek 到 {}ms 失败: {}", log_ctx(), time_ms, e);
                let start = msec_to_time(time_ms) - self.offset_pts;
                self.flush_buffers(Some(start), false, true);
                if self.play_speed != PLAYSPEED_PAUSE {
                    self.set_play_speed(PLAYSPEED_NORMAL);
                }
            }
        }

        if !request.trickplay {
            // 快进快退中不重新缓冲
            if self.play_speed == PLAYSPEED_NORMAL || self.play_speed == PLAYSPEED_PAUSE {
                self.set_caching(CachingState::Flush);
            }
            self.update_play_state(true);
        }
    }

    pub(super) fn seek_chapter(&mut self, chapter: usize) {
        let Some(start_ms) = chapter
            .checked_sub(1)
            .and_then(|i| self.chapters.get(i))
            .map(|c| c.start_ms)
        else {
            warn!(
                "{} ⚠️ 没有第 {} 章（共 {} 章）",
                log_ctx(),
                chapter,
                self.chapters.len()
            );
            return;
        };
        info!("{} 📖 跳到第 {} 章: {}ms", log_ctx(), chapter, start_ms);
        self.handle_seek(SeekRequest {
            restore: false,
            ..SeekRequest::to(start_ms)
        });
    }

    /// 清空所有管线；`pts` 是新的起点（时钟时间线），`accurate` 时丢弃它之前的包
    pub(super) fn flush_buffers(&mut self, pts: Option<i64>, accurate: bool, sync: bool) {
        let start_pts = if accurate { pts } else { None };
        self.trickplay.reset(pts);

        for current in self.current.iter_mut() {
            let is_av = matches!(current.stream_type, StreamType::Audio | StreamType::Video);
            if sync {
                current.inited = false;
                if is_av {
                    current.avsync = AvSync::Force;
                    current.start_time = None;
                    // 管线收到 Flush{sync} 后回到起始状态
                    current.sync_state = SyncState::Starting;
                }
            }
            current.reset_timestamps();
            current.start_pts = start_pts;
        }

        for stream_type in StreamType::ALL {
            if !self.current.get(stream_type).is_active() {
                continue;
            }
            let is_av = AV_TYPES.contains(&stream_type);
            self.send_to(
                stream_type,
                PipelineMessage::Flush {
                    sync: sync || !is_av,
                },
            );
        }

        if self.play_speed == PLAYSPEED_NORMAL || self.play_speed == PLAYSPEED_PAUSE {
            self.synchronize_av();
            self.purge_started_events();
            self.set_caching(CachingState::Flush);
        }

        if let (Some(pts), true) = (pts, sync) {
            self.shared.clock.discontinuity(pts);
        }
        self.update_play_state(true);
    }

    /// 同步屏障：等音视频管线处理完 Flush
    fn synchronize_av(&mut self) {
        let (ack_tx, ack_rx) = bounded(AV_TYPES.len());
        let mut expected = 0;
        for stream_type in AV_TYPES {
            if !self.current.get(stream_type).is_active() {
                continue;
            }
            let Some(pipeline) = self.pipelines.get_mut(stream_type) else {
                continue;
            };
            if pipeline
                .send_message(PipelineMessage::Synchronize(ack_tx.clone()))
                .is_ok()
            {
                expected += 1;
            }
        }
        drop(ack_tx);

        let deadline =
            Instant::now() + Duration::from_millis(self.settings.sync.synchronize_timeout_ms);
        let mut acked = 0;
        while acked < expected && !self.aborted() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} ⚠️ 同步屏障超时（{}/{} 个管线已确认）",
                    log_ctx(),
                    acked,
                    expected
                );
                break;
            }
            match ack_rx.recv_timeout((deadline - now).min(SYNCHRONIZE_SLICE)) {
                Ok(()) => acked += 1,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Flush 之前上报的 Started 已经过时
    fn purge_started_events(&mut self) {
        let is_started = |event: &PipelineEvent| matches!(event, PipelineEvent::Started { .. });
        self.deferred_events.retain(|event| !is_started(event));
        let pending: Vec<PipelineEvent> = self.events_rx.try_iter().collect();
        self.deferred_events
            .extend(pending.into_iter().filter(|event| !is_started(event)));
    }

    // ---------------------------------------------------------------
    // 速度
    // ---------------------------------------------------------------

    fn in_menu(&self) -> bool {
        self.caps.menu && self.source.in_menu()
    }

    pub(super) fn set_play_speed(&mut self, speed: i32) {
        if self.in_menu() && speed != PLAYSPEED_NORMAL && speed != PLAYSPEED_PAUSE {
            info!("{} 📋 菜单中只能正常速度播放", log_ctx());
            return;
        }
        if speed < 0 && !self.caps.seekable {
            warn!("{} ⚠️ 数据源不支持倒放", log_ctx());
            return;
        }
        if speed == self.play_speed {
            return;
        }

        let old_speed = self.play_speed;
        info!("{} ⏯ 播放速度 {} -> {}", log_ctx(), old_speed, speed);

        let video_pts = self
            .pipelines
            .get(StreamType::Video)
            .and_then(|p| p.current_pts());
        let position = video_pts.unwrap_or_else(|| self.shared.clock.now());

        if speed == PLAYSPEED_NORMAL && old_speed != PLAYSPEED_NORMAL && old_speed != PLAYSPEED_PAUSE {
            // 快进快退结束：从当前画面位置精确重新开始
            let time_ms = self.display_time_ms(position);
            self.internal.push_back(Command::Seek(SeekRequest {
                time_ms,
                relative: false,
                backward: true,
                accurate: true,
                restore: true,
                trickplay: true,
                sync: true,
            }));
        }
        if speed != PLAYSPEED_NORMAL && speed != PLAYSPEED_PAUSE {
            self.trickplay.reset(Some(position));
        }

        self.play_speed = speed;
        if !self.caching.pauses_clock() {
            self.apply_speed(speed);
        }
        self.update_play_state(true);
    }

    /// 把速度下发给时钟和所有打开的管线
    fn apply_speed(&mut self, speed: i32) {
        self.shared.clock.set_speed(speed);
        for stream_type in StreamType::ALL {
            if !self.current.get(stream_type).is_active() {
                continue;
            }
            if let Some(pipeline) = self.pipelines.get_mut(stream_type) {
                pipeline.set_speed(speed);
            }
        }
        self.stream_player_speed = speed;
    }

    // ---------------------------------------------------------------
    // 缓冲
    // ---------------------------------------------------------------

    pub(super) fn set_caching(&mut self, state: CachingState) {
        let mut state = state.resolve();
        if self.in_menu() {
            state = CachingState::Done;
        }
        if state == self.caching {
            return;
        }
        info!("{} ⏳ 缓冲状态 {:?} -> {:?}", log_ctx(), self.caching, state);

        if state.pauses_clock() {
            self.shared.clock.set_speed(PLAYSPEED_PAUSE);
            for stream_type in AV_TYPES {
                if let Some(pipeline) = self.pipelines.get_mut(stream_type) {
                    pipeline.set_speed(PLAYSPEED_PAUSE);
                }
            }
            self.stream_player_speed = PLAYSPEED_PAUSE;
        } else if state == CachingState::WaitCodec
            || (state == CachingState::Done && self.caching != CachingState::WaitCodec)
        {
            self.apply_speed(self.play_speed);
        }

        self.caching = state;
        self.caching_deadline =
            Instant::now() + Duration::from_millis(self.settings.sync.caching_timeout_ms);
        self.update_play_state(true);
    }

    fn caching_view(&self, stream_type: StreamType) -> Option<CachingView> {
        let current = self.current.get(stream_type);
        if !current.is_active() {
            return None;
        }
        let pipeline = self.pipelines.get(stream_type)?;
        Some(CachingView {
            starting: current.sync_state == SyncState::Starting,
            accepts_data: pipeline.accepts_data(),
            stalled: pipeline.is_stalled(),
            packets: current.packets,
        })
    }

    pub(super) fn check_caching(&mut self) {
        if !self.caching.is_caching() {
            return;
        }
        if self.in_menu() {
            self.set_caching(CachingState::Done);
            return;
        }
        let inputs = CachingInputs {
            audio: self.caching_view(StreamType::Audio),
            video: self.caching_view(StreamType::Video),
            timed_out: Instant::now() >= self.caching_deadline,
        };
        let next = next_state(self.caching, &inputs);
        if next != self.caching {
            if inputs.timed_out {
                warn!("{} ⌛ 缓冲状态 {:?} 超时，强制推进", log_ctx(), self.caching);
            }
            self.set_caching(next);
        }
    }

    // ---------------------------------------------------------------
    // 同步
    // ---------------------------------------------------------------

    fn sync_view(&self, stream_type: StreamType) -> Option<SyncView> {
        let current = self.current.get(stream_type);
        if !current.is_active() {
            return None;
        }
        let pipeline = self.pipelines.get(stream_type)?;
        Some(SyncView {
            state: current.sync_state,
            avsync: current.avsync,
            packets: current.packets,
            level: pipeline.level(),
            accepts_data: pipeline.accepts_data(),
            stalled: pipeline.is_stalled(),
            start_time: current.start_time,
            cache_time: current.cache_time,
            cache_total: current.cache_total,
        })
    }

    pub(super) fn check_sync(&mut self) {
        let inputs = SyncInputs {
            audio: self.sync_view(StreamType::Audio),
            video: self.sync_view(StreamType::Video),
            realtime: self.caps.realtime,
            eof: self.eof,
            clock: self.shared.clock.now(),
        };
        match evaluate(&inputs, &self.settings.sync) {
            SyncDecision::Wait => {}
            SyncDecision::ResyncSingle(stream_type) => {
                let clock = self.shared.clock.now();
                let current = self.current.get_mut(stream_type);
                current.sync_state = SyncState::InSync;
                current.avsync = AvSync::None;
                info!(
                    "{} 🔗 {} 单独同步到运行中的时钟 {}ms",
                    log_ctx(),
                    stream_type.as_str(),
                    time_to_msec(clock)
                );
                self.send_to(stream_type, PipelineMessage::Resync(clock));
            }
            SyncDecision::SyncAll(clock) => self.sync_all(clock),
            SyncDecision::FlushBuffers => {
                warn!("{} ⚠️ 视频一直没有开始输出，清空缓冲重新同步", log_ctx());
                self.flush_buffers(None, true, true);
            }
        }
    }

    fn sync_all(&mut self, clock: i64) {
        info!("{} 🔗 音视频同步，时钟起点 {}ms", log_ctx(), time_to_msec(clock));
        self.shared.clock.discontinuity(clock);
        for stream_type in AV_TYPES {
            let current = self.current.get_mut(stream_type);
            if !current.is_active() {
                continue;
            }
            current.sync_state = SyncState::InSync;
            current.avsync = AvSync::None;
            self.send_to(stream_type, PipelineMessage::Resync(clock));
        }

        // 经过 WaitStream 再进 WaitCodec
        if self.caching == CachingState::WaitFill {
            self.set_caching(CachingState::WaitStream);
        }
        if self.caching.is_caching() {
            self.set_caching(CachingState::WaitCodec);
        }
        self.sync_timer = Instant::now() + Duration::from_millis(self.settings.sync.sync_timer_ms);
        self.streams_ready = true;
        self.update_play_state(true);
    }

    // ---------------------------------------------------------------
    // 快进快退、卡顿与 EDL
    // ---------------------------------------------------------------

    pub(super) fn check_trickplay(&mut self) {
        let video = self.current.video();
        if !video.is_active() || !(video.inited || self.play_speed < 0) {
            return;
        }
        let video_pts = self
            .pipelines
            .get(StreamType::Video)
            .and_then(|p| p.current_pts());
        let request = self.trickplay.check(
            self.shared.clock.now(),
            video_pts,
            self.play_speed,
            self.offset_pts,
            &self.settings.sync,
        );
        if let Some(request) = request {
            self.internal.push_back(Command::Seek(request));
        }
    }

    fn level(&self, stream_type: StreamType) -> Option<u32> {
        if !self.current.get(stream_type).is_active() {
            return None;
        }
        self.pipelines.get(stream_type).map(|p| p.level())
    }

    fn is_stalled(&self, stream_type: StreamType) -> bool {
        let current = self.current.get(stream_type);
        current.is_active()
            && current.inited
            && self
                .pipelines
                .get(stream_type)
                .map_or(false, |p| p.is_stalled())
    }

    /// 正常播放中（缓冲完成后）的卡顿处理
    pub(super) fn check_stalls(&mut self) {
        if self.caching != CachingState::Done
            || self.play_speed != PLAYSPEED_NORMAL
            || self.eof
            || self.in_menu()
            || Instant::now() < self.sync_timer
        {
            return;
        }

        let audio_stalled = self.is_stalled(StreamType::Audio);
        let video_stalled = self.is_stalled(StreamType::Video);
        if audio_stalled || video_stalled {
            if self.handle_stall(audio_stalled) {
                return;
            }
        }

        if self.caps.realtime {
            self.adjust_live_speed();
        }
    }

    /// 返回 true 表示已经处理（清空或重新缓冲）
    fn handle_stall(&mut self, audio_stalled: bool) -> bool {
        let audio = self.current.audio();
        let video = self.current.video();
        let audio_level = self.level(StreamType::Audio);
        let video_level = self.level(StreamType::Video);

        if self.caps.realtime {
            let audio_dry = audio.sync_state == SyncState::InSync && audio_stalled;
            let video_dry = video.sync_state == SyncState::InSync && video_level == Some(0);
            let all_accept = AV_TYPES.iter().all(|&t| {
                !self.current.get(t).is_active()
                    || self.pipelines.get(t).map_or(true, |p| p.accepts_data())
            });
            if (audio_dry || video_dry) && all_accept {
                warn!("{} ⚠️ 直播源卡顿，清空缓冲重新同步", log_ctx());
                self.flush_buffers(None, true, true);
                return true;
            }
            return false;
        }

        let low = |level: Option<u32>| level.map_or(true, |l| l <= 50);
        if low(audio_level) && low(video_level) {
            info!(
                "{} ⏳ 队列见底（audio={:?} video={:?}），重新缓冲",
                log_ctx(),
                audio_level,
                video_level
            );
            self.set_caching(CachingState::Flush);
            return true;
        }

        if audio.sync_state == SyncState::InSync && audio.inited && audio_level == Some(0) {
            warn!("{} ⚠️ 音频队列已空，重新定位到当前位置", log_ctx());
            let time_ms = self.display_time_ms(self.shared.clock.now());
            self.internal.push_back(Command::Seek(SeekRequest {
                backward: true,
                ..SeekRequest::to(time_ms)
            }));
            return true;
        }
        false
    }

    fn adjust_live_speed(&mut self) {
        let Some(level) = self.level(StreamType::Audio) else {
            return;
        };
        let adjust = self.shared.clock.speed_adjust();
        if adjust >= 0.0 && level < 5 {
            info!("{} 🐢 直播音频水位 {}%，时钟放慢", log_ctx(), level);
            self.shared.clock.set_speed_adjust(LIVE_SLOWDOWN);
        } else if adjust < 0.0 && level > 10 {
            info!("{} 🐇 直播音频水位恢复到 {}%", log_ctx(), level);
            self.shared.clock.set_speed_adjust(0.0);
        }
    }

    /// EDL：播放进入剪切 / 广告区间时自动跳过，静音区间静音
    pub(super) fn check_auto_scene_skip(&mut self) {
        if self.caching != CachingState::Done || self.eof || self.edl.is_empty() {
            return;
        }
        if !self.current.audio().is_active() && !self.current.video().is_active() {
            return;
        }

        let time_ms = time_to_msec(self.shared.clock.now() + self.offset_pts);
        let edit = self.edl.in_edit(time_ms).copied();

        let in_mute = edit.map_or(false, |e| e.action == EdlAction::Mute);
        if in_mute != self.muted && self.current.audio().is_active() {
            info!(
                "{} {} EDL 静音区间 @{}ms",
                log_ctx(),
                if in_mute { "🔇 进入" } else { "🔊 离开" },
                time_ms
            );
            self.send_to(StreamType::Audio, PipelineMessage::SetMute(in_mute));
            self.muted = in_mute;
        }

        let Some(edit) = edit else {
            return;
        };
        if self.play_speed <= 0 || self.last_skipped_edit == Some(edit.start_ms) {
            return;
        }
        let skip = match edit.action {
            EdlAction::Cut => self.settings.edl.skip_cuts,
            EdlAction::CommBreak => true,
            EdlAction::Mute | EdlAction::Scene => false,
        };
        if !skip {
            return;
        }

        info!(
            "{} ✂️ 跳过 {:?} 区间 {}ms - {}ms",
            log_ctx(),
            edit.action,
            edit.start_ms,
            edit.end_ms
        );
        self.last_skipped_edit = Some(edit.start_ms);
        self.handle_seek(SeekRequest {
            restore: false,
            ..SeekRequest::to(edit.end_ms)
        });
    }
}
