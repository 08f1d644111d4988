use crate::core::{DemuxPacket, PlayerError, Result, SharedClock, StreamInfo, StreamType};
use crate::player::log_ctx;
use crate::player::pipeline::{
    EventSender, OutputPipeline, PipelineContext, PipelineEvent, PipelineMessage,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const NO_PTS: i64 = i64::MIN;
/// 数据队列空这么久就认为卡住
const STALL_TIMEOUT: Duration = Duration::from_millis(100);
/// 按时钟等待时的最长单次睡眠
const PACE_SLEEP: Duration = Duration::from_millis(10);
/// 硬容量 = 软容量 × 这个倍数（软容量用于计算水位和 accepts_data）
const HARD_CAPACITY_FACTOR: usize = 4;
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// 一次 `consume` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Done,
    /// 输出端暂时写不下，只处理了一部分；稍后用同一个包再调用
    Retry,
}

/// 管线线程里真正处理数据包的部分（解码 + 输出）
pub trait PacketConsumer: Send {
    /// 处理一个包；`drop` 为真时只需更新内部状态，不输出
    fn consume(&mut self, packet: &DemuxPacket, drop: bool, events: &EventSender) -> Result<Consumed>;

    fn flush(&mut self) {}

    fn reset(&mut self) {}

    fn set_mute(&mut self, _mute: bool) {}

    fn set_speed(&mut self, _speed: i32) {}

    /// 已送入但尚未输出的时长（微秒）
    fn cache_time(&mut self) -> i64 {
        0
    }

    /// 内部缓冲总容量（微秒）
    fn cache_total(&self) -> i64 {
        0
    }

    /// 允许比时钟提前送入的时长（微秒），音频用它把设备缓冲填满
    fn lead_time(&self) -> i64 {
        0
    }

    /// 由最后送入的时间戳推算正在输出的时间戳
    fn presented_pts(&mut self, last_pts: i64) -> i64 {
        last_pts
    }

    /// 数据源结束：把内部缓冲输出完
    fn drain(&mut self) {}

    fn close(&mut self) {}
}

/// 按打开时的格式提示创建 PacketConsumer
pub type ConsumerFactory = Box<dyn FnMut(&StreamInfo) -> Result<Box<dyn PacketConsumer>> + Send>;

/// 线程间共享的管线状态
struct Shared {
    stalled: AtomicBool,
    current_pts: AtomicI64,
    speed: AtomicI32,
    /// 每次 Flush 递增，旧批次的数据包直接丢弃
    epoch: AtomicU64,
    /// 正在等待队列输出完后关闭
    closing: AtomicBool,
}

enum Control {
    Message(PipelineMessage),
    Speed(i32),
    Close,
}

enum DataKind {
    Packet { packet: DemuxPacket, drop: bool },
    Eof,
    Close,
}

struct DataItem {
    epoch: u64,
    kind: DataKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    /// 等第一个可输出的包
    Starting,
    /// 已上报 Started，等 Resync
    WaitSync,
    Synced,
}

/// 在独立线程中运行 PacketConsumer 的输出管线
///
/// - 控制队列（无界）优先处理：Flush / Resync / 同步屏障 / 静音 / 速度
/// - 数据队列有界，水位按软容量计算
/// - Synced 状态下可以按共享时钟控制输出节奏
pub struct ThreadedPipeline {
    stream_type: StreamType,
    factory: ConsumerFactory,
    clock: SharedClock,
    events: EventSender,
    pace: bool,
    soft_capacity: usize,
    shared: Arc<Shared>,
    control_tx: Option<Sender<Control>>,
    data_tx: Option<Sender<DataItem>>,
    // 保留一个接收端，Flush 时在协调器一侧直接清空队列
    data_rx: Option<Receiver<DataItem>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ThreadedPipeline {
    pub fn new(
        stream_type: StreamType,
        factory: ConsumerFactory,
        context: &PipelineContext,
        pace: bool,
    ) -> Self {
        let queues = &context.settings.pipeline;
        let soft_capacity = match stream_type {
            StreamType::Audio => queues.audio_queue_packets,
            StreamType::Video => queues.video_queue_packets,
            _ => queues.other_queue_packets,
        }
        .max(1);

        Self {
            stream_type,
            factory,
            clock: context.clock.clone(),
            events: context.events.clone(),
            pace,
            soft_capacity,
            shared: Arc::new(Shared {
                stalled: AtomicBool::new(true),
                current_pts: AtomicI64::new(NO_PTS),
                speed: AtomicI32::new(context.clock.speed()),
                epoch: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
            control_tx: None,
            data_tx: None,
            data_rx: None,
            thread_handle: None,
        }
    }

    fn queued(&self) -> usize {
        self.data_tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    fn send_control(&self, control: Control) {
        if let Some(tx) = &self.control_tx {
            if tx.send(control).is_err() {
                warn!("{} ⚠️ {} 管线线程已退出，控制消息被丢弃", log_ctx(), self.stream_type.as_str());
            }
        }
    }

    fn send_data(&self, kind: DataKind) -> Result<()> {
        let tx = self.data_tx.as_ref().ok_or_else(|| {
            PlayerError::PipelineError(format!("{} 管线未打开", self.stream_type.as_str()))
        })?;
        let item = DataItem {
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            kind,
        };
        tx.send_timeout(item, SEND_TIMEOUT).map_err(|e| {
            PlayerError::PipelineError(format!(
                "{} 数据队列发送失败: {}",
                self.stream_type.as_str(),
                e
            ))
        })
    }

    fn drain_queue(&self) -> usize {
        let mut dropped = 0;
        if let Some(rx) = &self.data_rx {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        dropped
    }
}

impl OutputPipeline for ThreadedPipeline {
    fn open_stream(&mut self, hint: &StreamInfo) -> Result<()> {
        if self.thread_handle.is_some() {
            self.close_stream(false);
        }

        let consumer = (self.factory)(hint)?;

        let (control_tx, control_rx) = unbounded::<Control>();
        let (data_tx, data_rx) = bounded::<DataItem>(self.soft_capacity * HARD_CAPACITY_FACTOR);

        self.shared.stalled.store(true, Ordering::SeqCst);
        self.shared.current_pts.store(NO_PTS, Ordering::SeqCst);
        self.shared.closing.store(false, Ordering::SeqCst);

        let worker = Worker {
            stream_type: self.stream_type,
            consumer,
            control_rx,
            data_rx: data_rx.clone(),
            shared: self.shared.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            pace: self.pace,
            phase: SyncPhase::Starting,
            pending: None,
        };

        let handle = thread::Builder::new()
            .name(format!("{}-output", self.stream_type.as_str()))
            .spawn(move || worker.run())?;

        info!(
            "{} 🔈 打开 {} 管线: id={} codec={}",
            log_ctx(),
            self.stream_type.as_str(),
            hint.id,
            hint.codec
        );

        self.control_tx = Some(control_tx);
        self.data_tx = Some(data_tx);
        self.data_rx = Some(data_rx);
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn close_stream(&mut self, wait: bool) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        info!(
            "{} 🛑 关闭 {} 管线（wait={}）",
            log_ctx(),
            self.stream_type.as_str(),
            wait
        );

        // 等待时把 Close 排在数据后面，否则直接走控制队列
        self.shared.closing.store(wait, Ordering::SeqCst);
        let queued_close = wait && self.send_data(DataKind::Close).is_ok();
        if !queued_close {
            self.drain_queue();
            self.send_control(Control::Close);
        }

        self.control_tx.take();
        self.data_tx.take();
        self.data_rx.take();

        if handle.join().is_err() {
            error!("{} ❌ {} 管线线程 panic", log_ctx(), self.stream_type.as_str());
        }
        self.shared.stalled.store(true, Ordering::SeqCst);
        self.shared.current_pts.store(NO_PTS, Ordering::SeqCst);
    }

    fn send_message(&mut self, message: PipelineMessage) -> Result<()> {
        match message {
            PipelineMessage::Packet { packet, drop } => self.send_data(DataKind::Packet { packet, drop }),
            PipelineMessage::Eof => self.send_data(DataKind::Eof),
            PipelineMessage::Flush { sync } => {
                if self.thread_handle.is_none() {
                    return Ok(());
                }
                self.shared.epoch.fetch_add(1, Ordering::SeqCst);
                let dropped = self.drain_queue();
                debug!(
                    "{} 🧹 {} 管线 Flush（sync={}，丢弃 {} 个包）",
                    log_ctx(),
                    self.stream_type.as_str(),
                    sync,
                    dropped
                );
                self.send_control(Control::Message(PipelineMessage::Flush { sync }));
                Ok(())
            }
            PipelineMessage::Synchronize(ack) => {
                if self.thread_handle.is_none() {
                    // 没有线程可等，直接放行
                    if ack.send(()).is_err() {
                        debug!("{} {} 管线同步屏障的等待方已放弃", log_ctx(), self.stream_type.as_str());
                    }
                    return Ok(());
                }
                self.send_control(Control::Message(PipelineMessage::Synchronize(ack)));
                Ok(())
            }
            other => {
                self.send_control(Control::Message(other));
                Ok(())
            }
        }
    }

    fn level(&self) -> u32 {
        ((self.queued() * 100 / self.soft_capacity).min(100)) as u32
    }

    fn accepts_data(&self) -> bool {
        self.thread_handle.is_none() || self.queued() < self.soft_capacity
    }

    fn is_stalled(&self) -> bool {
        self.shared.stalled.load(Ordering::SeqCst)
    }

    fn current_pts(&self) -> Option<i64> {
        match self.shared.current_pts.load(Ordering::SeqCst) {
            NO_PTS => None,
            pts => Some(pts),
        }
    }

    fn set_speed(&mut self, speed: i32) {
        if self.shared.speed.swap(speed, Ordering::SeqCst) != speed {
            self.send_control(Control::Speed(speed));
        }
    }

    fn is_active(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl Drop for ThreadedPipeline {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!(
                "{} ⚠ {} 管线被 drop 时仍在运行，正在停止",
                log_ctx(),
                self.stream_type.as_str()
            );
            self.close_stream(false);
        }
    }
}

/// 管线线程本体
struct Worker {
    stream_type: StreamType,
    consumer: Box<dyn PacketConsumer>,
    control_rx: Receiver<Control>,
    data_rx: Receiver<DataItem>,
    shared: Arc<Shared>,
    clock: SharedClock,
    events: EventSender,
    pace: bool,
    phase: SyncPhase,
    /// 等待呈现时间的包
    pending: Option<(DemuxPacket, bool)>,
}

impl Worker {
    fn run(mut self) {
        info!("{} 🎬 {} 管线线程启动", log_ctx(), self.stream_type.as_str());
        let speed = self.shared.speed.load(Ordering::SeqCst);
        self.consumer.set_speed(speed);

        let mut presented: u64 = 0;
        loop {
            // 优先处理所有控制消息（非阻塞）
            loop {
                match self.control_rx.try_recv() {
                    Ok(control) => {
                        if !self.handle_control(control) {
                            self.finish(presented);
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            if self.phase == SyncPhase::WaitSync && self.shared.closing.load(Ordering::SeqCst) {
                // 关闭前不会再有 Resync，直接把剩余数据输出
                self.phase = SyncPhase::Synced;
            }

            if self.phase == SyncPhase::WaitSync {
                // 等协调器的 Resync，期间不消费数据（队列会逐渐填满）
                match self.control_rx.recv_timeout(STALL_TIMEOUT) {
                    Ok(control) => {
                        if !self.handle_control(control) {
                            self.finish(presented);
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            if let Some((packet, drop)) = self.pending.take() {
                if let Some(wait) = self.time_until_due(&packet, drop) {
                    thread::sleep(wait.min(PACE_SLEEP));
                    self.pending = Some((packet, drop));
                    continue;
                }
                if self.present(&packet, drop) {
                    presented += 1;
                } else if self.shared.closing.load(Ordering::SeqCst) {
                    debug!(
                        "{} {} 管线关闭中，放弃没写完的包",
                        log_ctx(),
                        self.stream_type.as_str()
                    );
                } else {
                    // 先处理控制消息（Flush / 恢复播放），再用同一个包重试
                    thread::sleep(PACE_SLEEP);
                    self.pending = Some((packet, drop));
                }
                continue;
            }

            match self.data_rx.recv_timeout(STALL_TIMEOUT) {
                Ok(item) => {
                    if item.epoch != self.shared.epoch.load(Ordering::SeqCst) {
                        continue;
                    }
                    match item.kind {
                        DataKind::Packet { packet, drop } => self.pending = Some((packet, drop)),
                        DataKind::Eof => {
                            debug!("{} 📄 {} 管线收到 EOF", log_ctx(), self.stream_type.as_str());
                            self.consumer.drain();
                            self.shared.stalled.store(true, Ordering::SeqCst);
                            if let Err(e) = self.events.send(PipelineEvent::Drained(self.stream_type)) {
                                debug!("{} {} 管线 Drained 事件无人接收: {}", log_ctx(), self.stream_type.as_str(), e);
                            }
                        }
                        DataKind::Close => {
                            self.consumer.drain();
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.shared.stalled.store(true, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.finish(presented);
    }

    fn finish(&mut self, presented: u64) {
        self.consumer.close();
        info!(
            "{} 🛑 {} 管线线程退出（共输出 {} 个包）",
            log_ctx(),
            self.stream_type.as_str(),
            presented
        );
    }

    /// 处理一条控制消息；返回 false 表示线程应退出
    fn handle_control(&mut self, control: Control) -> bool {
        match control {
            Control::Close => return false,
            Control::Speed(speed) => self.consumer.set_speed(speed),
            Control::Message(message) => match message {
                PipelineMessage::Resync(clock) => {
                    debug!(
                        "{} ⏱ {} 管线 Resync: {}us",
                        log_ctx(),
                        self.stream_type.as_str(),
                        clock
                    );
                    self.phase = SyncPhase::Synced;
                }
                PipelineMessage::Flush { sync } => {
                    self.consumer.flush();
                    self.pending = None;
                    self.shared.stalled.store(true, Ordering::SeqCst);
                    self.shared.current_pts.store(NO_PTS, Ordering::SeqCst);
                    if sync {
                        self.phase = SyncPhase::Starting;
                    }
                }
                PipelineMessage::Synchronize(ack) => {
                    if ack.send(()).is_err() {
                        debug!("{} {} 管线同步屏障的等待方已放弃", log_ctx(), self.stream_type.as_str());
                    }
                }
                PipelineMessage::Reset => {
                    self.consumer.reset();
                    self.pending = None;
                    self.phase = SyncPhase::Starting;
                }
                PipelineMessage::SetMute(mute) => self.consumer.set_mute(mute),
                PipelineMessage::Packet { .. } | PipelineMessage::Eof => {
                    warn!("{} ⚠️ 数据消息走了控制队列，已忽略", log_ctx());
                }
            },
        }
        true
    }

    /// 需要按时钟等待时返回剩余时长
    fn time_until_due(&self, packet: &DemuxPacket, drop: bool) -> Option<Duration> {
        if drop
            || !self.pace
            || self.phase != SyncPhase::Synced
            || self.shared.closing.load(Ordering::SeqCst)
        {
            return None;
        }
        let pts = packet.pts.or(packet.dts)?;
        let wait = pts - self.consumer.lead_time() - self.clock.now();
        if wait > 0 {
            Some(Duration::from_micros(wait as u64))
        } else {
            None
        }
    }

    /// 输出一个包；返回 false 表示输出端没写完，需要重试
    fn present(&mut self, packet: &DemuxPacket, drop: bool) -> bool {
        match self.consumer.consume(packet, drop, &self.events) {
            Ok(Consumed::Done) => {}
            Ok(Consumed::Retry) => return false,
            Err(e) => {
                warn!(
                    "{} ⚠️ {} 管线处理数据包失败: {}",
                    log_ctx(),
                    self.stream_type.as_str(),
                    e
                );
                return true;
            }
        }
        if drop {
            return true;
        }

        let timestamp = packet.pts.or(packet.dts);
        match self.phase {
            SyncPhase::Starting => {
                let event = PipelineEvent::Started {
                    stream_type: self.stream_type,
                    timestamp,
                    cache_time: self.consumer.cache_time(),
                    cache_total: self.consumer.cache_total(),
                };
                if self.events.send(event).is_err() {
                    warn!("{} ⚠️ 协调器已退出，Started 事件被丢弃", log_ctx());
                }
                self.phase = SyncPhase::WaitSync;
            }
            SyncPhase::Synced => {
                self.shared.stalled.store(false, Ordering::SeqCst);
                if let Some(pts) = timestamp {
                    let presented = self.consumer.presented_pts(pts);
                    self.shared.current_pts.store(presented, Ordering::SeqCst);
                }
            }
            SyncPhase::WaitSync => {}
        }
        true
    }
}

/// 只做记账、不输出任何东西的 PacketConsumer（无头模式 / 测试用）
#[derive(Debug, Default)]
pub struct NullConsumer {
    consumed: u64,
}

impl NullConsumer {
    pub fn factory() -> ConsumerFactory {
        Box::new(|_hint: &StreamInfo| Ok(Box::new(NullConsumer::default()) as Box<dyn PacketConsumer>))
    }
}

impl PacketConsumer for NullConsumer {
    fn consume(&mut self, _packet: &DemuxPacket, drop: bool, _events: &EventSender) -> Result<Consumed> {
        if !drop {
            self.consumed += 1;
        }
        Ok(Consumed::Done)
    }
}
