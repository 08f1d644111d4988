//! 播放协调器
//!
//! 一个协调器线程负责一次播放会话：从数据源读包，把包分发到各媒体类型的
//! 输出管线，并用缓冲状态机和同步状态机让所有管线按同一个时钟呈现。
//! 管线通过事件通道上报 Started / Drained，UI 通过 `PlayerHandle` 发命令。

pub mod caching;
pub mod continuity;
mod control;
pub mod handle;
pub mod messages;
mod streams;
pub mod sync;
pub mod trickplay;

#[cfg(test)]
mod tests;

use crate::core::{
    time_to_msec, Chapter, DemuxPacket, PlayState, PlayerError, PlayerSettings, Result,
    SessionOutcome, SharedClock, StreamInfo, StreamSource, StreamType, PLAYSPEED_NORMAL,
    PLAYSPEED_PAUSE,
};
use crate::player::current_stream::{CurrentStreams, SyncState};
use crate::player::edl::{EdlAction, Edl};
use crate::player::log_ctx;
use crate::player::pipeline::{PipelineEvent, PipelineMessage, PipelineSet};
use crate::player::registry::{SelectionStreams, SharedSelectionStreams};
use crate::player::source::{Source, SourceCaps};
use caching::CachingState;
use continuity::{check_continuity, check_player_init, Continuity};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use messages::{coalesce, Command};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trickplay::TrickplayState;

pub use handle::PlayerHandle;

/// 管线拒收数据时的退避
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);
/// EOF 后等管线输出完的轮询间隔
const EOF_POLL: Duration = Duration::from_millis(100);

/// 协调器与 `PlayerHandle` 共享的会话资源
#[derive(Clone)]
pub struct SessionShared {
    pub clock: SharedClock,
    pub registry: SharedSelectionStreams,
    pub play_state: Arc<RwLock<PlayState>>,
    pub abort: Arc<AtomicBool>,
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            clock: SharedClock::new(),
            registry: SelectionStreams::shared(),
            play_state: Arc::new(RwLock::new(PlayState::default())),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// 会话选项
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub settings: PlayerSettings,
    pub edl: Edl,
}

/// 外挂字幕数据源，和主数据源交错读取
struct Sidecar {
    source: Box<dyn Source>,
    origin: StreamSource,
    /// 已读出、还没到时间的包
    pending: Option<DemuxPacket>,
    eof: bool,
}

pub struct Coordinator {
    settings: PlayerSettings,
    source: Box<dyn Source>,
    caps: SourceCaps,
    sidecar: Option<Sidecar>,
    pipelines: PipelineSet,
    shared: SessionShared,
    current: CurrentStreams,

    caching: CachingState,
    caching_deadline: Instant,
    /// 同步完成后的保护期，期间不处理卡顿
    sync_timer: Instant,
    streams_ready: bool,

    /// 用户要求的速度
    play_speed: i32,
    /// 实际下发给管线的速度（缓冲时为暂停）
    stream_player_speed: i32,
    /// 暂停前的速度
    resume_speed: i32,
    /// 源时间戳 - 时钟时间
    offset_pts: i64,
    trickplay: TrickplayState,

    edl: Edl,
    muted: bool,
    /// 已自动跳过的区间（按起点）
    last_skipped_edit: Option<i64>,
    chapters: Vec<Chapter>,

    commands_rx: Receiver<Command>,
    /// 协调器自己产生的命令，下一轮和外部命令一起处理
    internal: VecDeque<Command>,
    events_rx: Receiver<PipelineEvent>,
    deferred_events: VecDeque<PipelineEvent>,

    /// 打开失败的流，之后不再尝试
    disabled: HashSet<(StreamSource, i32)>,
    caption_streams: Vec<StreamInfo>,
    subtitle_visible: bool,
    last_state_update: Option<Instant>,

    eof: bool,
    eof_sent: HashSet<StreamType>,
    drained: HashSet<StreamType>,
}

impl Coordinator {
    pub fn new(
        source: Box<dyn Source>,
        pipelines: PipelineSet,
        shared: SessionShared,
        options: SessionOptions,
        commands_rx: Receiver<Command>,
        events_rx: Receiver<PipelineEvent>,
    ) -> Self {
        let caps = source.caps();
        let now = Instant::now();
        Self {
            settings: options.settings,
            source,
            caps,
            sidecar: None,
            pipelines,
            shared,
            current: CurrentStreams::new(),
            caching: CachingState::Done,
            caching_deadline: now,
            sync_timer: now,
            streams_ready: false,
            play_speed: PLAYSPEED_NORMAL,
            stream_player_speed: PLAYSPEED_NORMAL,
            resume_speed: PLAYSPEED_NORMAL,
            offset_pts: 0,
            trickplay: TrickplayState::new(),
            edl: options.edl,
            muted: false,
            last_skipped_edit: None,
            chapters: Vec::new(),
            commands_rx,
            internal: VecDeque::new(),
            events_rx,
            deferred_events: VecDeque::new(),
            disabled: HashSet::new(),
            caption_streams: Vec::new(),
            subtitle_visible: false,
            last_state_update: None,
            eof: false,
            eof_sent: HashSet::new(),
            drained: HashSet::new(),
        }
    }

    /// 运行整个会话（阻塞到结束）
    pub fn run(mut self) -> SessionOutcome {
        info!(
            "{} ▶️ 播放会话开始: {} caps={:?}",
            log_ctx(),
            self.source.description(),
            self.caps
        );
        self.source.attach_abort(self.shared.abort.clone());
        self.start();

        let outcome = self.main_loop();
        self.teardown(&outcome);
        outcome
    }

    fn aborted(&self) -> bool {
        self.shared.abort.load(Ordering::SeqCst)
    }

    fn start(&mut self) {
        self.chapters = self.source.chapters();
        let origin = self.source.origin();
        let streams = self.source.streams();
        self.register_streams(origin, &streams);
        info!(
            "{} 📎 数据源共 {} 个流，{} 个章节，时长 {}ms，输出管线 {:?}",
            log_ctx(),
            streams.len(),
            self.chapters.len(),
            self.source.stream_length(),
            self.pipelines.types()
        );

        self.open_default_streams();
        self.set_caching(CachingState::Flush);
        self.update_play_state(true);
    }

    fn main_loop(&mut self) -> SessionOutcome {
        loop {
            if self.aborted() {
                info!("{} ⏹ 收到停止请求", log_ctx());
                return SessionOutcome::Stopped;
            }

            self.handle_commands();
            self.handle_events();
            self.check_sync();
            self.check_caching();
            self.check_trickplay();
            self.check_stalls();
            self.check_auto_scene_skip();
            self.update_play_state(false);

            if self.eof {
                if self.all_drained() {
                    info!("{} 🏁 所有管线已输出完毕", log_ctx());
                    return SessionOutcome::Ended;
                }
                thread::sleep(EOF_POLL);
                continue;
            }

            if self.is_backpressured() {
                continue;
            }

            match self.read_packet() {
                Ok(Some((packet, origin))) => self.process_packet(packet, origin),
                Ok(None) => self.on_eof(),
                Err(PlayerError::Aborted) => return SessionOutcome::Stopped,
                Err(e) => {
                    error!("{} ❌ 读取数据包失败: {}", log_ctx(), e);
                    return SessionOutcome::Failed(e);
                }
            }
        }
    }

    fn teardown(&mut self, outcome: &SessionOutcome) {
        let wait = !self.aborted() && matches!(outcome, SessionOutcome::Ended);
        for stream_type in StreamType::ALL {
            self.close_stream(stream_type, wait);
        }
        self.shared.registry.lock().clear(None, None);
        self.update_play_state(true);
        info!("{} ⏹ 播放会话结束: {:?}", log_ctx(), outcome);
    }

    // ---------------------------------------------------------------
    // 命令与事件
    // ---------------------------------------------------------------

    fn handle_commands(&mut self) {
        let mut batch: Vec<Command> = self.internal.drain(..).collect();
        batch.extend(self.commands_rx.try_iter());
        if batch.is_empty() {
            return;
        }

        let received = batch.len();
        let batch = coalesce(batch);
        if batch.len() < received {
            debug!("{} 🔁 合并了 {} 个过时的 Seek", log_ctx(), received - batch.len());
        }
        for command in batch {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: Command) {
        debug!("{} 📨 处理命令: {}", log_ctx(), command.name());
        match command {
            Command::Seek(request) => {
                if !request.trickplay {
                    self.last_skipped_edit = None;
                }
                self.handle_seek(request);
            }
            Command::SeekChapter(chapter) => self.seek_chapter(chapter),
            Command::SetSpeed(speed) => self.set_play_speed(speed),
            Command::Pause => {
                if !self.caps.pausable {
                    warn!("{} ⚠️ 数据源不支持暂停，忽略", log_ctx());
                    return;
                }
                if self.play_speed != PLAYSPEED_PAUSE {
                    self.resume_speed = self.play_speed;
                    self.set_play_speed(PLAYSPEED_PAUSE);
                }
            }
            Command::Resume => {
                if self.play_speed == PLAYSPEED_PAUSE {
                    self.set_play_speed(self.resume_speed);
                }
            }
            Command::SelectStream { stream_type, index } => self.select_stream(stream_type, index),
            Command::SetSubtitleVisible(visible) => {
                self.subtitle_visible = visible;
                self.update_play_state(true);
            }
            Command::AddSubtitleSource(source) => self.add_sidecar(source),
        }
    }

    fn handle_events(&mut self) {
        let mut events: Vec<PipelineEvent> = self.deferred_events.drain(..).collect();
        events.extend(self.events_rx.try_iter());
        for event in events {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Started {
                stream_type,
                timestamp,
                cache_time,
                cache_total,
            } => {
                let current = self.current.get_mut(stream_type);
                if !current.is_active() {
                    return;
                }
                match stream_type {
                    StreamType::Audio | StreamType::Video => {
                        if current.sync_state == SyncState::Starting {
                            current.set_started(timestamp, cache_time, cache_total);
                            debug!(
                                "{} 🟢 {} 管线开始输出: pts={:?} cache={}us/{}us",
                                log_ctx(),
                                stream_type.as_str(),
                                timestamp,
                                cache_time,
                                cache_total
                            );
                        }
                    }
                    _ => {
                        // 字幕等不参与音视频同步，直接对齐到当前时钟
                        current.set_started(timestamp, cache_time, cache_total);
                        current.sync_state = SyncState::InSync;
                        let clock = self.shared.clock.now();
                        self.send_to(stream_type, PipelineMessage::Resync(clock));
                    }
                }
            }
            PipelineEvent::Drained(stream_type) => {
                debug!("{} 📭 {} 管线已输出完", log_ctx(), stream_type.as_str());
                self.drained.insert(stream_type);
            }
            PipelineEvent::CaptionStreams(streams) => {
                info!("{} 💬 视频流内嵌 {} 个字幕流", log_ctx(), streams.len());
                self.shared.registry.lock().clear(None, Some(StreamSource::VideoMux));
                self.register_streams(StreamSource::VideoMux, &streams);
                self.caption_streams = streams;
            }
            PipelineEvent::CaptionPacket(packet) => {
                let subtitle = self.current.get(StreamType::Subtitle);
                if subtitle.is_bound_to(StreamSource::VideoMux, packet.stream_id) {
                    self.process_other(StreamType::Subtitle, packet);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // 读包与分发
    // ---------------------------------------------------------------

    /// 任一音视频管线拒收时退避，返回 true 表示本轮不读包
    fn is_backpressured(&self) -> bool {
        let mut levels = Vec::with_capacity(2);
        for stream_type in [StreamType::Audio, StreamType::Video] {
            if !self.current.get(stream_type).is_active() {
                continue;
            }
            let Some(pipeline) = self.pipelines.get(stream_type) else {
                continue;
            };
            if !pipeline.accepts_data() {
                thread::sleep(BACKPRESSURE_SLEEP);
                return true;
            }
            levels.push(pipeline.level());
        }
        if levels.len() == 2 && levels.iter().all(|&level| level > 50) {
            thread::yield_now();
        }
        false
    }

    fn read_packet(&mut self) -> Result<Option<(DemuxPacket, StreamSource)>> {
        if let Some(packet) = self.read_sidecar() {
            return Ok(Some(packet));
        }

        let Some(mut packet) = self.source.read_packet()? else {
            return Ok(None);
        };
        packet.apply_correction(self.offset_pts);
        Ok(Some((packet, self.source.origin())))
    }

    /// 外挂字幕的包在不超前于音视频时间线时才输出
    fn read_sidecar(&mut self) -> Option<(DemuxPacket, StreamSource)> {
        let subtitle_accepts = self
            .pipelines
            .get(StreamType::Subtitle)
            .map_or(false, |p| p.accepts_data());
        if !subtitle_accepts {
            return None;
        }

        let audio = self.current.audio();
        let video = self.current.video();
        let av_bound = audio.is_active() || video.is_active();
        let max_av_dts = [audio.dts, video.dts].into_iter().flatten().max();
        let offset_pts = self.offset_pts;

        let sidecar = self.sidecar.as_mut()?;
        if sidecar.pending.is_none() && !sidecar.eof {
            match sidecar.source.read_packet() {
                Ok(Some(packet)) => sidecar.pending = Some(packet),
                Ok(None) => sidecar.eof = true,
                Err(e) => {
                    warn!("{} ⚠️ 外挂字幕读取失败，停止读取: {}", log_ctx(), e);
                    sidecar.eof = true;
                }
            }
        }

        let due = match (&sidecar.pending, max_av_dts) {
            (Some(packet), Some(max_dts)) => packet.dts.map_or(true, |dts| dts - offset_pts <= max_dts),
            (Some(_), None) => !av_bound,
            (None, _) => false,
        };
        if !due {
            return None;
        }
        let mut packet = sidecar.pending.take()?;
        packet.apply_correction(offset_pts);
        Some((packet, sidecar.origin))
    }

    fn process_packet(&mut self, packet: DemuxPacket, origin: StreamSource) {
        let Some(stream_type) = self.resolve_stream(origin, packet.stream_id) else {
            return;
        };
        match stream_type {
            StreamType::Audio | StreamType::Video => self.process_av(stream_type, packet),
            _ => self.process_other(stream_type, packet),
        }
    }

    fn process_av(&mut self, stream_type: StreamType, mut packet: DemuxPacket) {
        let outcome = check_continuity(
            &mut self.current,
            stream_type,
            &mut packet,
            &mut self.offset_pts,
            self.play_speed,
            &self.settings.sync,
        );
        match outcome {
            Continuity::Corrected(correction) => info!(
                "{} ⏭ {} 时间戳跳变 {}ms，已修正（offset={}ms）",
                log_ctx(),
                stream_type.as_str(),
                time_to_msec(correction),
                time_to_msec(self.offset_pts)
            ),
            Continuity::Unconfirmed => debug!(
                "{} ❓ {} 时间戳跳变，等待另一路确认",
                log_ctx(),
                stream_type.as_str()
            ),
            Continuity::Continuous | Continuity::Skipped => {}
        }

        self.current.get_mut(stream_type).update_timestamps(&packet);
        let drop = check_player_init(&mut self.current, stream_type, &self.settings.sync)
            || self.in_skipped_edit(stream_type);
        self.send_packet(stream_type, packet, drop);
    }

    fn process_other(&mut self, stream_type: StreamType, packet: DemuxPacket) {
        self.current.get_mut(stream_type).update_timestamps(&packet);
        let drop = check_player_init(&mut self.current, stream_type, &self.settings.sync)
            || self.in_skipped_edit(stream_type);
        self.send_packet(stream_type, packet, drop);
    }

    /// 当前包是否落在要跳过的 EDL 区间里
    fn in_skipped_edit(&self, stream_type: StreamType) -> bool {
        let current = self.current.get(stream_type);
        if !current.inited {
            return false;
        }
        let Some(dts) = current.dts else {
            return false;
        };
        let Some(edit) = self.edl.in_edit(time_to_msec(dts + self.offset_pts)) else {
            return false;
        };
        match edit.action {
            EdlAction::Cut => self.settings.edl.skip_cuts,
            EdlAction::Mute => stream_type == StreamType::Audio,
            EdlAction::Scene | EdlAction::CommBreak => false,
        }
    }

    fn send_packet(&mut self, stream_type: StreamType, packet: DemuxPacket, drop: bool) {
        let Some(pipeline) = self.pipelines.get_mut(stream_type) else {
            return;
        };
        match pipeline.send_message(PipelineMessage::Packet { packet, drop }) {
            Ok(()) => {
                if !drop {
                    self.current.get_mut(stream_type).packets += 1;
                }
            }
            Err(e) => warn!(
                "{} ⚠️ 发送 {} 数据包失败: {}",
                log_ctx(),
                stream_type.as_str(),
                e
            ),
        }
    }

    fn send_to(&mut self, stream_type: StreamType, message: PipelineMessage) {
        if let Some(pipeline) = self.pipelines.get_mut(stream_type) {
            if let Err(e) = pipeline.send_message(message) {
                warn!(
                    "{} ⚠️ 发送消息到 {} 管线失败: {}",
                    log_ctx(),
                    stream_type.as_str(),
                    e
                );
            }
        }
    }

    // ---------------------------------------------------------------
    // 结束
    // ---------------------------------------------------------------

    fn on_eof(&mut self) {
        if self.eof {
            return;
        }
        info!("{} 📄 数据源读取完毕，等待管线输出", log_ctx());
        for stream_type in StreamType::ALL {
            let current = self.current.get(stream_type);
            if current.is_active() && current.inited {
                self.send_to(stream_type, PipelineMessage::Eof);
                self.eof_sent.insert(stream_type);
            }
        }
        for current in self.current.iter_mut() {
            current.inited = false;
        }
        self.set_caching(CachingState::Done);
        self.eof = true;
        self.update_play_state(true);
    }

    fn all_drained(&self) -> bool {
        self.eof_sent.iter().all(|t| self.drained.contains(t))
    }

    // ---------------------------------------------------------------
    // 状态快照
    // ---------------------------------------------------------------

    /// 源时间（微秒，时钟时间线）→ 去掉剪切的显示时间（毫秒）
    fn display_time_ms(&self, clock: i64) -> i64 {
        let source_ms = time_to_msec(clock + self.offset_pts);
        if self.settings.edl.skip_cuts {
            self.edl.remove_cut_time(source_ms)
        } else {
            source_ms
        }
    }

    fn update_play_state(&mut self, force: bool) {
        let interval = Duration::from_millis(self.settings.play_state_interval_ms);
        if !force && self.last_state_update.map_or(false, |t| t.elapsed() < interval) {
            return;
        }
        self.last_state_update = Some(Instant::now());

        let clock = self.shared.clock.now();
        let source_ms = time_to_msec(clock + self.offset_pts);
        let cut_ms = if self.settings.edl.skip_cuts {
            self.edl.total_cut_time_ms()
        } else {
            0
        };
        let chapter = self
            .chapters
            .iter()
            .rposition(|c| c.start_ms <= source_ms)
            .map_or(0, |i| i + 1);
        let cache_level = [StreamType::Audio, StreamType::Video]
            .into_iter()
            .filter(|&t| self.current.get(t).is_active())
            .filter_map(|t| self.pipelines.get(t).map(|p| p.level()))
            .min()
            .map_or(0.0, |level| level as f32 / 100.0);

        let (audio_stream, video_stream, subtitle_stream) = {
            let registry = self.shared.registry.lock();
            let index_of = |stream_type: StreamType| {
                let current = self.current.get(stream_type);
                match (current.source, current.id) {
                    (Some(source), Some(id)) => registry.index_of(stream_type, source, id),
                    _ => None,
                }
            };
            (
                index_of(StreamType::Audio),
                index_of(StreamType::Video),
                index_of(StreamType::Subtitle),
            )
        };

        let state = PlayState {
            time_ms: self.display_time_ms(clock).max(0),
            total_time_ms: (self.source.stream_length() - cut_ms).max(0),
            chapter,
            chapter_count: self.chapters.len(),
            can_seek: self.caps.seekable,
            can_pause: self.caps.pausable,
            cache_level,
            is_in_menu: self.caps.menu && self.source.in_menu(),
            caching: self.caching.is_caching(),
            speed: self.play_speed,
            audio_stream,
            video_stream,
            subtitle_stream,
            subtitle_visible: self.subtitle_visible,
            streams_ready: self.streams_ready,
        };
        *self.shared.play_state.write() = state;
    }
}
