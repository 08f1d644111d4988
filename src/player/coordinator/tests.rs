use super::messages::Command;
use super::*;
use crate::core::{msec_to_time, PlayerError, SeekRequest, StreamFlags};
use crate::player::current_stream::AvSync;
use crate::player::pipeline::{OutputPipeline, PipelineContext};
use crate::player::pipeline_thread::{NullConsumer, ThreadedPipeline};
use crate::player::synthetic::{SyntheticConfig, SyntheticSource};
use crate::player::text_subtitle::TextSubtitleSource;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

// ---------------------------------------------------------------
// 测试替身
// ---------------------------------------------------------------

struct MockSource {
    streams: Vec<StreamInfo>,
    packets: VecDeque<DemuxPacket>,
    seeks: Arc<Mutex<Vec<(i64, bool)>>>,
    caps: SourceCaps,
}

impl MockSource {
    fn new(streams: Vec<StreamInfo>) -> Self {
        Self {
            streams,
            packets: VecDeque::new(),
            seeks: Arc::new(Mutex::new(Vec::new())),
            caps: SourceCaps {
                seekable: true,
                pausable: true,
                ..Default::default()
            },
        }
    }
}

impl Source for MockSource {
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>> {
        Ok(self.packets.pop_front())
    }

    fn stream(&self, id: i32) -> Option<StreamInfo> {
        self.streams.iter().find(|s| s.id == id).cloned()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn seek_time(&mut self, time_ms: i64, backward: bool) -> Result<Option<i64>> {
        self.seeks.lock().push((time_ms, backward));
        self.packets.clear();
        Ok(Some(msec_to_time(time_ms)))
    }

    fn stream_length(&self) -> i64 {
        60_000
    }

    fn caps(&self) -> SourceCaps {
        self.caps
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}

/// 管线收到的消息（去掉包内容）
#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Open(i32),
    Close,
    Packet { dts: Option<i64>, drop: bool },
    Eof,
    Resync(i64),
    Flush { sync: bool },
    Synchronize,
    Reset,
    SetMute(bool),
}

/// 测试里随时可以改的队列状态
#[derive(Debug, Clone, Copy)]
struct MockState {
    level: u32,
    accepts_data: bool,
    stalled: bool,
    current_pts: Option<i64>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            level: 0,
            accepts_data: true,
            stalled: true,
            current_pts: None,
        }
    }
}

#[derive(Clone, Default)]
struct MockPipeline {
    log: Arc<Mutex<Vec<Recorded>>>,
    state: Arc<Mutex<MockState>>,
    /// 这些流 ID 打开时失败
    fail_ids: Vec<i32>,
    active: bool,
}

impl MockPipeline {
    fn failing(ids: &[i32]) -> Self {
        Self {
            fail_ids: ids.to_vec(),
            ..Default::default()
        }
    }

    fn packets(&self) -> Vec<(Option<i64>, bool)> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Packet { dts, drop } => Some((*dts, *drop)),
                _ => None,
            })
            .collect()
    }

    fn contains(&self, recorded: &Recorded) -> bool {
        self.log.lock().contains(recorded)
    }

    fn count(&self, matches: impl Fn(&Recorded) -> bool) -> usize {
        self.log.lock().iter().filter(|r| matches(r)).count()
    }

    fn opens(&self) -> usize {
        self.count(|r| matches!(r, Recorded::Open(_)))
    }

    fn resyncs(&self) -> usize {
        self.count(|r| matches!(r, Recorded::Resync(_)))
    }
}

impl OutputPipeline for MockPipeline {
    fn open_stream(&mut self, hint: &StreamInfo) -> Result<()> {
        if self.fail_ids.contains(&hint.id) {
            return Err(PlayerError::StreamOpen {
                stream_type: hint.stream_type.unwrap_or(StreamType::Audio),
                id: hint.id,
                reason: "mock 拒绝".to_string(),
            });
        }
        self.active = true;
        self.log.lock().push(Recorded::Open(hint.id));
        Ok(())
    }

    fn close_stream(&mut self, _wait: bool) {
        self.active = false;
        self.log.lock().push(Recorded::Close);
    }

    fn send_message(&mut self, message: PipelineMessage) -> Result<()> {
        let recorded = match message {
            PipelineMessage::Packet { packet, drop } => Recorded::Packet {
                dts: packet.dts,
                drop,
            },
            PipelineMessage::Eof => Recorded::Eof,
            PipelineMessage::Resync(clock) => Recorded::Resync(clock),
            PipelineMessage::Flush { sync } => Recorded::Flush { sync },
            PipelineMessage::Synchronize(ack) => {
                let _ = ack.send(());
                Recorded::Synchronize
            }
            PipelineMessage::Reset => Recorded::Reset,
            PipelineMessage::SetMute(mute) => Recorded::SetMute(mute),
        };
        self.log.lock().push(recorded);
        Ok(())
    }

    fn level(&self) -> u32 {
        self.state.lock().level
    }

    fn accepts_data(&self) -> bool {
        self.state.lock().accepts_data
    }

    fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    fn current_pts(&self) -> Option<i64> {
        self.state.lock().current_pts
    }

    fn set_speed(&mut self, _speed: i32) {}

    fn is_active(&self) -> bool {
        self.active
    }
}

fn stream(id: i32, stream_type: StreamType, language: &str, default: bool) -> StreamInfo {
    StreamInfo {
        id,
        stream_type: Some(stream_type),
        codec: "mock".to_string(),
        language: language.to_string(),
        flags: StreamFlags {
            default,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn av_streams() -> Vec<StreamInfo> {
    vec![
        stream(0, StreamType::Video, "", true),
        stream(1, StreamType::Audio, "eng", true),
    ]
}

fn packet(stream_id: i32, dts_ms: i64, duration_ms: i64) -> DemuxPacket {
    DemuxPacket {
        stream_id,
        dts: Some(msec_to_time(dts_ms)),
        pts: Some(msec_to_time(dts_ms)),
        duration: Some(msec_to_time(duration_ms)),
        ..Default::default()
    }
}

struct Harness {
    coordinator: Coordinator,
    commands_tx: Sender<Command>,
    events_tx: Sender<PipelineEvent>,
    audio: MockPipeline,
    video: MockPipeline,
    subtitle: MockPipeline,
}

fn harness<S: Source + 'static>(source: S, audio: MockPipeline, video: MockPipeline, edl: Edl) -> Harness {
    let (commands_tx, commands_rx) = unbounded();
    let (events_tx, events_rx) = unbounded();
    let subtitle = MockPipeline::default();
    let pipelines = PipelineSet::new()
        .with(StreamType::Audio, Box::new(audio.clone()))
        .with(StreamType::Video, Box::new(video.clone()))
        .with(StreamType::Subtitle, Box::new(subtitle.clone()));
    let options = SessionOptions {
        settings: PlayerSettings::default(),
        edl,
    };
    let coordinator = Coordinator::new(
        Box::new(source),
        pipelines,
        SessionShared::new(),
        options,
        commands_rx,
        events_rx,
    );
    Harness {
        coordinator,
        commands_tx,
        events_tx,
        audio,
        video,
        subtitle,
    }
}

fn started(h: &Harness, stream_type: StreamType, timestamp_ms: i64) {
    h.events_tx
        .send(PipelineEvent::Started {
            stream_type,
            timestamp: Some(msec_to_time(timestamp_ms)),
            cache_time: 0,
            cache_total: 0,
        })
        .unwrap();
}

/// 两路都已同步、缓冲完成、过了同步保护期
fn start_playing(h: &mut Harness) {
    h.coordinator.start();
    h.coordinator.process_packet(packet(1, 0, 40), StreamSource::Demux);
    h.coordinator.process_packet(packet(0, 0, 40), StreamSource::Demux);
    for stream_type in [StreamType::Audio, StreamType::Video] {
        let current = h.coordinator.current.get_mut(stream_type);
        current.sync_state = SyncState::InSync;
        current.avsync = AvSync::None;
    }
    h.coordinator.set_caching(CachingState::Done);
    h.coordinator.sync_timer = Instant::now();
}

/// 从数据源读一个包并交给协调器处理
fn pump(h: &mut Harness) -> Option<(StreamSource, Option<i64>)> {
    let (packet, origin) = h.coordinator.read_packet().unwrap()?;
    let dts = packet.dts;
    h.coordinator.process_packet(packet, origin);
    Some((origin, dts))
}

// ---------------------------------------------------------------
// 协调器内部
// ---------------------------------------------------------------

#[test]
fn test_start_opens_default_streams_and_caches() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    h.coordinator.start();

    assert_eq!(h.coordinator.current.video().id, Some(0));
    assert_eq!(h.coordinator.current.audio().id, Some(1));
    assert!(h.audio.contains(&Recorded::Open(1)));
    assert!(h.video.contains(&Recorded::Open(0)));
    assert_eq!(h.coordinator.caching, CachingState::WaitFill);
    assert_eq!(h.coordinator.shared.clock.speed(), PLAYSPEED_PAUSE);

    let state = h.coordinator.shared.play_state.read().clone();
    assert_eq!(state.audio_stream, Some(0));
    assert!(state.caching);
    assert!(!state.streams_ready);
}

#[test]
fn test_pending_seeks_are_coalesced() {
    let source = MockSource::new(av_streams());
    let seeks = source.seeks.clone();
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    h.coordinator.start();

    for time_ms in [1000, 5000, 7000] {
        h.commands_tx.send(Command::Seek(SeekRequest::to(time_ms))).unwrap();
    }
    h.coordinator.handle_commands();

    assert_eq!(*seeks.lock(), vec![(7000, false)]);
    // 精确 Seek：目标之前的包丢弃
    assert_eq!(h.coordinator.current.video().start_pts, Some(msec_to_time(7000)));
    assert!(h.video.contains(&Recorded::Flush { sync: true }));
    assert!(h.audio.contains(&Recorded::Synchronize));
    assert_eq!(h.coordinator.current.audio().avsync, AvSync::Force);
}

#[test]
fn test_outlier_is_sent_without_timestamps() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    h.coordinator.start();

    for dts in [0, 40, 80] {
        h.coordinator.process_packet(packet(1, dts, 40), StreamSource::Demux);
        h.coordinator.process_packet(packet(0, dts, 40), StreamSource::Demux);
    }
    h.coordinator.process_packet(packet(0, 2000, 40), StreamSource::Demux);
    h.coordinator.process_packet(packet(0, 120, 40), StreamSource::Demux);

    let dts: Vec<Option<i64>> = h.video.packets().into_iter().map(|(dts, _)| dts).collect();
    assert_eq!(
        dts,
        vec![
            Some(0),
            Some(msec_to_time(40)),
            Some(msec_to_time(80)),
            None,
            Some(msec_to_time(120)),
        ]
    );
    assert_eq!(h.coordinator.offset_pts, 0);
}

#[test]
fn test_failed_stream_is_disabled() {
    let mut streams = av_streams();
    streams.push(stream(2, StreamType::Audio, "fra", false));
    let mut h = harness(
        MockSource::new(streams),
        MockPipeline::failing(&[1]),
        MockPipeline::default(),
        Edl::new(),
    );
    h.coordinator.start();

    // 默认音轨打不开，退到下一条
    assert!(h.coordinator.disabled.contains(&(StreamSource::Demux, 1)));
    assert_eq!(h.coordinator.current.audio().id, Some(2));

    // 用户再选它也不会重试
    let index = h
        .coordinator
        .shared
        .registry
        .lock()
        .index_of(StreamType::Audio, StreamSource::Demux, 1)
        .unwrap();
    h.coordinator.select_stream(StreamType::Audio, index);
    assert!(!h.coordinator.current.audio().is_active());
    let opens = h
        .audio
        .log
        .lock()
        .iter()
        .filter(|r| matches!(r, Recorded::Open(_)))
        .count();
    assert_eq!(opens, 1);
}

#[test]
fn test_select_audio_stream_requeues_seek() {
    let mut streams = av_streams();
    streams.push(stream(2, StreamType::Audio, "fra", false));
    let source = MockSource::new(streams);
    let seeks = source.seeks.clone();
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    h.coordinator.start();

    let index = h
        .coordinator
        .shared
        .registry
        .lock()
        .index_of(StreamType::Audio, StreamSource::Demux, 2)
        .unwrap();
    h.commands_tx
        .send(Command::SelectStream {
            stream_type: StreamType::Audio,
            index,
        })
        .unwrap();
    h.coordinator.handle_commands();

    assert_eq!(h.coordinator.current.audio().id, Some(2));
    assert!(h.audio.contains(&Recorded::Open(2)));
    assert_eq!(h.coordinator.internal.len(), 1);

    // 下一轮执行排队的精确 Seek
    h.coordinator.handle_commands();
    assert_eq!(*seeks.lock(), vec![(0, true)]);
}

#[test]
fn test_started_events_sync_both_pipelines() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    h.coordinator.start();
    for dts in [1000, 1040] {
        h.coordinator.process_packet(packet(1, dts, 40), StreamSource::Demux);
        h.coordinator.process_packet(packet(0, dts, 40), StreamSource::Demux);
    }

    for stream_type in [StreamType::Audio, StreamType::Video] {
        h.events_tx
            .send(PipelineEvent::Started {
                stream_type,
                timestamp: Some(msec_to_time(1000)),
                cache_time: 0,
                cache_total: 0,
            })
            .unwrap();
    }
    h.coordinator.handle_events();
    h.coordinator.check_sync();

    let clock = msec_to_time(1000);
    assert!(h.audio.contains(&Recorded::Resync(clock)));
    assert!(h.video.contains(&Recorded::Resync(clock)));
    assert_eq!(h.coordinator.current.audio().sync_state, SyncState::InSync);
    assert_eq!(h.coordinator.caching, CachingState::WaitCodec);
    assert!(h.coordinator.streams_ready);
}

#[test]
fn test_cut_packets_are_dropped() {
    let mut h = harness(
        MockSource::new(vec![stream(1, StreamType::Audio, "eng", true)]),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::parse("1 2 0"),
    );
    h.coordinator.start();
    for dts in [0, 500, 1000, 1500, 2000] {
        h.coordinator.process_packet(packet(1, dts, 500), StreamSource::Demux);
    }

    let drops: Vec<bool> = h.audio.packets().into_iter().map(|(_, drop)| drop).collect();
    assert_eq!(drops, vec![false, false, true, true, false]);
    // 丢弃的包不算进缓冲
    assert_eq!(h.coordinator.current.audio().packets, 3);
}

#[test]
fn test_eof_waits_for_drained_pipelines() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    h.coordinator.start();
    h.coordinator.process_packet(packet(1, 0, 40), StreamSource::Demux);
    h.coordinator.process_packet(packet(0, 0, 40), StreamSource::Demux);
    h.coordinator.on_eof();

    assert!(h.audio.contains(&Recorded::Eof));
    assert!(h.video.contains(&Recorded::Eof));
    assert_eq!(h.coordinator.caching, CachingState::Done);
    assert!(!h.coordinator.all_drained());

    h.events_tx.send(PipelineEvent::Drained(StreamType::Audio)).unwrap();
    h.coordinator.handle_events();
    assert!(!h.coordinator.all_drained());
    h.events_tx.send(PipelineEvent::Drained(StreamType::Video)).unwrap();
    h.coordinator.handle_events();
    assert!(h.coordinator.all_drained());
}

#[test]
fn test_format_change_reopens_and_resyncs_single_stream() {
    let source = SyntheticSource::new(SyntheticConfig {
        duration_ms: 3000,
        format_change_at_ms: Some(1000),
        ..Default::default()
    });
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    h.coordinator.start();
    // 刚打开的流只能整体同步
    assert_eq!(h.coordinator.current.video().avsync, AvSync::Force);
    assert_eq!(h.coordinator.current.audio().avsync, AvSync::Force);

    for _ in 0..10 {
        pump(&mut h);
    }
    started(&h, StreamType::Audio, 0);
    started(&h, StreamType::Video, 0);
    h.coordinator.handle_events();
    h.coordinator.check_sync();
    assert!(h.audio.contains(&Recorded::Resync(0)));
    assert!(h.video.contains(&Recorded::Resync(0)));

    // 读到 1s 处的视频包时格式变化，只重新打开视频管线
    for _ in 0..200 {
        if h.video.opens() == 2 {
            break;
        }
        pump(&mut h);
    }
    assert_eq!(h.video.opens(), 2);
    assert_eq!(h.audio.opens(), 1);
    assert_eq!(h.coordinator.current.video().changes, 1);
    let video = h.coordinator.current.video();
    assert_eq!(video.sync_state, SyncState::Starting);
    // 时间戳和重开前连续，已确认
    assert_eq!(video.avsync, AvSync::Cont);
    assert_eq!(h.coordinator.current.audio().sync_state, SyncState::InSync);

    // 管线还没开始输出：不同步
    h.coordinator.check_sync();
    assert_eq!(h.video.resyncs(), 1);

    started(&h, StreamType::Video, 1000);
    h.coordinator.handle_events();
    h.coordinator.check_sync();
    assert_eq!(h.video.resyncs(), 2);
    assert_eq!(h.audio.resyncs(), 1);
    let video = h.coordinator.current.video();
    assert_eq!(video.sync_state, SyncState::InSync);
    assert_eq!(video.avsync, AvSync::None);
}

#[test]
fn test_unconfirmed_reopen_waits_for_continuity() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    start_playing(&mut h);

    // 视频关掉后重新打开，音频在播放：先等连续性确认
    h.coordinator.close_stream(StreamType::Video, false);
    assert!(h.coordinator.open_stream(StreamType::Video, StreamSource::Demux, 0, false));
    assert_eq!(h.coordinator.current.video().avsync, AvSync::Check);

    // 第一个包没有参照，不算确认
    h.coordinator.process_packet(packet(0, 40, 40), StreamSource::Demux);
    started(&h, StreamType::Video, 40);
    h.coordinator.handle_events();
    h.coordinator.check_sync();
    assert_eq!(h.coordinator.current.video().sync_state, SyncState::WaitSync);
    assert_eq!(h.video.resyncs(), 0);

    h.coordinator.process_packet(packet(0, 80, 40), StreamSource::Demux);
    assert_eq!(h.coordinator.current.video().avsync, AvSync::Cont);
    h.coordinator.check_sync();
    assert_eq!(h.video.resyncs(), 1);
    assert_eq!(h.audio.resyncs(), 0);
    assert_eq!(h.coordinator.current.video().sync_state, SyncState::InSync);
}

#[test]
fn test_trickplay_to_normal_queues_accurate_seek() {
    let source = MockSource::new(av_streams());
    let seeks = source.seeks.clone();
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    start_playing(&mut h);

    h.coordinator.set_play_speed(4000);
    assert!(h.coordinator.internal.is_empty());

    h.video.state.lock().current_pts = Some(msec_to_time(3000));
    h.coordinator.set_play_speed(PLAYSPEED_NORMAL);
    match h.coordinator.internal.back() {
        Some(Command::Seek(request)) => assert_eq!(
            *request,
            SeekRequest {
                time_ms: 3000,
                relative: false,
                backward: true,
                accurate: true,
                restore: true,
                trickplay: true,
                sync: true,
            }
        ),
        _ => panic!("没有排队的 Seek"),
    }

    h.coordinator.handle_commands();
    assert_eq!(*seeks.lock(), vec![(3000, true)]);
    assert_eq!(h.coordinator.current.video().start_pts, Some(msec_to_time(3000)));
}

#[test]
fn test_seek_during_trickplay_keeps_caching() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    start_playing(&mut h);
    h.coordinator.set_play_speed(4000);

    h.commands_tx.send(Command::Seek(SeekRequest::to(5000))).unwrap();
    h.coordinator.handle_commands();
    assert_eq!(h.coordinator.caching, CachingState::Done);

    // 正常速度的 Seek 重新缓冲
    h.coordinator.play_speed = PLAYSPEED_NORMAL;
    h.commands_tx.send(Command::Seek(SeekRequest::to(8000))).unwrap();
    h.coordinator.handle_commands();
    assert_eq!(h.coordinator.caching, CachingState::WaitFill);
}

#[test]
fn test_low_queues_rewait() {
    let mut h = harness(
        MockSource::new(av_streams()),
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    start_playing(&mut h);
    h.audio.state.lock().level = 20;
    h.video.state.lock().level = 30;

    h.coordinator.check_stalls();
    assert_eq!(h.coordinator.caching, CachingState::WaitFill);
    assert!(h.coordinator.internal.is_empty());
    assert!(!h.audio.contains(&Recorded::Flush { sync: true }));
}

#[test]
fn test_dry_audio_queues_seek() {
    let source = MockSource::new(av_streams());
    let seeks = source.seeks.clone();
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    start_playing(&mut h);
    h.video.state.lock().level = 80;

    h.coordinator.check_stalls();
    assert_eq!(h.coordinator.caching, CachingState::Done);
    match h.coordinator.internal.back() {
        Some(Command::Seek(request)) => {
            assert!(request.backward);
            assert!(request.accurate);
        }
        _ => panic!("没有排队的 Seek"),
    }

    h.coordinator.handle_commands();
    let seeks = seeks.lock();
    assert_eq!(seeks.len(), 1);
    assert!(seeks[0].1);
}

#[test]
fn test_realtime_stall_flushes() {
    let mut source = MockSource::new(av_streams());
    source.caps.realtime = true;
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    start_playing(&mut h);
    h.video.state.lock().level = 80;

    h.coordinator.check_stalls();
    assert!(h.audio.contains(&Recorded::Flush { sync: true }));
    assert!(h.video.contains(&Recorded::Flush { sync: true }));
    let audio = h.coordinator.current.audio();
    assert_eq!(audio.sync_state, SyncState::Starting);
    assert_eq!(audio.avsync, AvSync::Force);
    assert_eq!(h.coordinator.caching, CachingState::WaitFill);

    // 有管线拒收数据时不清空
    let mut h = harness(
        {
            let mut source = MockSource::new(av_streams());
            source.caps.realtime = true;
            source
        },
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::new(),
    );
    start_playing(&mut h);
    h.video.state.lock().accepts_data = false;
    h.coordinator.check_stalls();
    assert!(!h.audio.contains(&Recorded::Flush { sync: true }));
    assert_eq!(h.coordinator.caching, CachingState::Done);
}

#[test]
fn test_live_speed_follows_audio_level() {
    let mut source = MockSource::new(av_streams());
    source.caps.realtime = true;
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    start_playing(&mut h);
    for pipeline in [&h.audio, &h.video] {
        let mut state = pipeline.state.lock();
        state.stalled = false;
        state.level = 60;
    }

    h.coordinator.check_stalls();
    assert_eq!(h.coordinator.shared.clock.speed_adjust(), 0.0);

    h.audio.state.lock().level = 3;
    h.coordinator.check_stalls();
    assert!(h.coordinator.shared.clock.speed_adjust() < 0.0);

    // 5..=10 之间保持放慢
    h.audio.state.lock().level = 8;
    h.coordinator.check_stalls();
    assert!(h.coordinator.shared.clock.speed_adjust() < 0.0);

    h.audio.state.lock().level = 20;
    h.coordinator.check_stalls();
    assert_eq!(h.coordinator.shared.clock.speed_adjust(), 0.0);
}

#[test]
fn test_sidecar_packets_follow_av_timeline() {
    let mut source = MockSource::new(av_streams());
    for dts in (0..=2500).step_by(500) {
        source.packets.push_back(packet(1, dts, 500));
        source.packets.push_back(packet(0, dts, 500));
    }
    let mut h = harness(source, MockPipeline::default(), MockPipeline::default(), Edl::new());
    h.coordinator.start();

    let srt = "1\n00:00:01,000 --> 00:00:01,800\n第一句\n\n2\n00:00:02,000 --> 00:00:02,800\n第二句\n";
    let sidecar = TextSubtitleSource::from_content(srt, "srt").unwrap();
    h.coordinator.add_sidecar(Box::new(sidecar));
    assert!(h.coordinator.current.get(StreamType::Subtitle).is_bound_to(StreamSource::Text, 0));
    assert!(h.subtitle.contains(&Recorded::Open(0)));

    let mut order = Vec::new();
    while let Some((origin, dts)) = pump(&mut h) {
        order.push((origin == StreamSource::Text, dts.map(time_to_msec)));
    }
    let expected: Vec<(bool, Option<i64>)> = [
        (false, 0),
        (false, 0),
        (false, 500),
        (false, 500),
        (false, 1000),
        (true, 1000),
        (false, 1000),
        (false, 1500),
        (false, 1500),
        (false, 2000),
        (true, 2000),
        (false, 2000),
        (false, 2500),
        (false, 2500),
    ]
    .into_iter()
    .map(|(text, ms)| (text, Some(ms)))
    .collect();
    assert_eq!(order, expected);
    assert_eq!(h.subtitle.packets().len(), 2);
}

#[test]
fn test_edl_mute_and_commercial_skip() {
    let source = MockSource::new(av_streams());
    let seeks = source.seeks.clone();
    let mut h = harness(
        source,
        MockPipeline::default(),
        MockPipeline::default(),
        Edl::parse("2 4 1\n10 12 3"),
    );
    start_playing(&mut h);
    let clock = h.coordinator.shared.clock.clone();

    clock.discontinuity(msec_to_time(2500));
    h.coordinator.check_auto_scene_skip();
    clock.discontinuity(msec_to_time(2600));
    h.coordinator.check_auto_scene_skip();
    assert!(h.coordinator.muted);
    assert_eq!(h.audio.count(|r| *r == Recorded::SetMute(true)), 1);

    clock.discontinuity(msec_to_time(4500));
    h.coordinator.check_auto_scene_skip();
    assert!(!h.coordinator.muted);
    assert!(h.audio.contains(&Recorded::SetMute(false)));
    assert!(seeks.lock().is_empty());

    // 进入广告区间：跳到区间末尾
    clock.discontinuity(msec_to_time(10_500));
    h.coordinator.check_auto_scene_skip();
    assert_eq!(*seeks.lock(), vec![(12_000, false)]);
    assert_eq!(h.coordinator.last_skipped_edit, Some(10_000));

    // 同一个区间只自动跳一次
    h.coordinator.set_caching(CachingState::Done);
    clock.discontinuity(msec_to_time(10_600));
    h.coordinator.check_auto_scene_skip();
    assert_eq!(seeks.lock().len(), 1);
}

// ---------------------------------------------------------------
// 整个会话
// ---------------------------------------------------------------

fn null_pipelines(context: PipelineContext) -> PipelineSet {
    let mut pipelines = PipelineSet::new();
    for stream_type in [StreamType::Audio, StreamType::Video, StreamType::Subtitle] {
        pipelines.insert(
            stream_type,
            Box::new(ThreadedPipeline::new(
                stream_type,
                NullConsumer::factory(),
                &context,
                true,
            )),
        );
    }
    pipelines
}

fn wait_outcome(rx: &crossbeam_channel::Receiver<SessionOutcome>) -> SessionOutcome {
    rx.recv_timeout(Duration::from_secs(15))
        .expect("会话没有在超时前结束")
}

#[test]
fn test_session_plays_to_end() {
    let source = SyntheticSource::new(SyntheticConfig {
        duration_ms: 1200,
        ..Default::default()
    });
    let (done_tx, done_rx) = unbounded();
    let mut handle = PlayerHandle::spawn(
        Box::new(source),
        SessionOptions::default(),
        null_pipelines,
        move |outcome| {
            let _ = done_tx.send(outcome);
        },
    )
    .unwrap();

    let outcome = wait_outcome(&done_rx);
    assert!(matches!(outcome, SessionOutcome::Ended), "{:?}", outcome);
    handle.join();
    assert!(handle.play_state().streams_ready);
}

#[test]
fn test_stop_ends_session() {
    let source = SyntheticSource::new(SyntheticConfig {
        duration_ms: 60_000,
        ..Default::default()
    });
    let (done_tx, done_rx) = unbounded();
    let mut handle = PlayerHandle::spawn(
        Box::new(source),
        SessionOptions::default(),
        null_pipelines,
        move |outcome| {
            let _ = done_tx.send(outcome);
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(300));
    handle.stop();
    let outcome = wait_outcome(&done_rx);
    assert!(matches!(outcome, SessionOutcome::Stopped), "{:?}", outcome);
    handle.join();
}

#[test]
fn test_open_failure_reports_failed() {
    let mut options = SessionOptions::default();
    options.settings.open_retry.max_attempts = 2;
    options.settings.open_retry.retry_interval_ms = 1;
    let (done_tx, done_rx) = unbounded();
    let mut handle = PlayerHandle::open(
        options,
        |_attempt| Err(PlayerError::OpenError("无法连接".to_string())),
        null_pipelines,
        move |outcome| {
            let _ = done_tx.send(outcome);
        },
    )
    .unwrap();

    let outcome = wait_outcome(&done_rx);
    assert!(
        matches!(outcome, SessionOutcome::Failed(PlayerError::SourceUnavailable { .. })),
        "{:?}",
        outcome
    );
    handle.join();
}
