use crate::core::{DemuxPacket, PlayerSettings, Result, SharedClock, StreamInfo, StreamType};
use crossbeam_channel::Sender;
use std::collections::HashMap;

/// 协调器发往输出管线的消息（所有权随消息转移）
#[derive(Debug)]
pub enum PipelineMessage {
    /// 数据包；`drop` 为真时只做队列记账，不呈现
    Packet { packet: DemuxPacket, drop: bool },
    /// 数据源已读完
    Eof,
    /// 以给定时钟值开始呈现（微秒）
    Resync(i64),
    /// 清空队列；`sync` 为真时回到起始状态，等待下一次同步
    Flush { sync: bool },
    /// 同步屏障：管线处理到这里后回复
    Synchronize(Sender<()>),
    /// 重置内部状态（格式不变）
    Reset,
    /// EDL 静音区间
    SetMute(bool),
}

/// 输出管线上报给协调器的事件
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// 开始产生输出：第一个可呈现的包的时间戳以及内部缓冲时长（微秒）
    Started {
        stream_type: StreamType,
        timestamp: Option<i64>,
        cache_time: i64,
        cache_total: i64,
    },
    /// 数据源 EOF 后队列已全部输出
    Drained(StreamType),
    /// 视频流里发现的内嵌字幕（CC）
    CaptionStreams(Vec<StreamInfo>),
    /// 内嵌字幕数据包（stream_id 对应 CaptionStreams 中的 id）
    CaptionPacket(DemuxPacket),
}

pub type EventSender = Sender<PipelineEvent>;

/// 单一媒体类型的输出管线
///
/// 真正的解码 / 渲染在管线内部完成，协调器只关心队列与时间。
pub trait OutputPipeline: Send {
    /// 按格式提示打开流；失败时协调器会永久禁用这个流
    fn open_stream(&mut self, hint: &StreamInfo) -> Result<()>;

    /// 关闭流；`wait` 为真时等队列输出完再返回
    fn close_stream(&mut self, wait: bool);

    fn send_message(&mut self, message: PipelineMessage) -> Result<()>;

    /// 队列水位 0..=100
    fn level(&self) -> u32;

    /// 队列还能接收数据
    fn accepts_data(&self) -> bool;

    /// 没有在实际输出（队列空或尚未开始呈现）
    fn is_stalled(&self) -> bool;

    /// 最近呈现的时间戳（微秒）
    fn current_pts(&self) -> Option<i64>;

    fn set_speed(&mut self, speed: i32);

    /// 当前是否打开了流
    fn is_active(&self) -> bool;
}

/// 构造输出管线时可用的会话资源
#[derive(Clone)]
pub struct PipelineContext {
    pub clock: SharedClock,
    pub events: EventSender,
    pub settings: PlayerSettings,
}

/// 会话内各媒体类型的输出管线
#[derive(Default)]
pub struct PipelineSet {
    pipelines: HashMap<StreamType, Box<dyn OutputPipeline>>,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stream_type: StreamType, pipeline: Box<dyn OutputPipeline>) -> Self {
        self.insert(stream_type, pipeline);
        self
    }

    pub fn insert(&mut self, stream_type: StreamType, pipeline: Box<dyn OutputPipeline>) {
        self.pipelines.insert(stream_type, pipeline);
    }

    pub fn get(&self, stream_type: StreamType) -> Option<&dyn OutputPipeline> {
        self.pipelines.get(&stream_type).map(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, stream_type: StreamType) -> Option<&mut (dyn OutputPipeline + 'static)> {
        self.pipelines.get_mut(&stream_type).map(|p| p.as_mut())
    }

    pub fn contains(&self, stream_type: StreamType) -> bool {
        self.pipelines.contains_key(&stream_type)
    }

    pub fn types(&self) -> Vec<StreamType> {
        StreamType::ALL
            .into_iter()
            .filter(|t| self.pipelines.contains_key(t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::pipeline_thread::{NullConsumer, ThreadedPipeline};
    use crossbeam_channel::unbounded;

    #[test]
    fn test_pipeline_set_lists_configured_types() {
        let (events, _events_rx) = unbounded();
        let context = PipelineContext {
            clock: SharedClock::new(),
            events,
            settings: PlayerSettings::default(),
        };
        let set = PipelineSet::new()
            .with(
                StreamType::Subtitle,
                Box::new(ThreadedPipeline::new(StreamType::Subtitle, NullConsumer::factory(), &context, false)),
            )
            .with(
                StreamType::Audio,
                Box::new(ThreadedPipeline::new(StreamType::Audio, NullConsumer::factory(), &context, false)),
            );

        assert!(set.contains(StreamType::Audio));
        assert!(!set.contains(StreamType::Video));
        assert_eq!(set.types(), vec![StreamType::Audio, StreamType::Subtitle]);
        assert!(set.get(StreamType::Video).is_none());
    }
}
