use crate::core::{msec_to_time, DemuxPacket, StreamInfo, StreamSource, StreamType};

/// 默认包时长（没有任何信息时）
pub const DEFAULT_DURATION: i64 = msec_to_time(40);

/// 单路流的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// 刚打开 / 刚 Flush，管线还没有输出
    Starting,
    /// 管线已开始输出，等其他流
    WaitSync,
    /// 已按共同时钟对齐
    InSync,
}

/// 连续性检查状态（单路流重新打开时使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvSync {
    None,
    /// Flush 后需要整体同步
    Force,
    /// 另一路已同步，本路等待连续性确认
    Check,
    /// 已确认连续，可以单独对齐到运行中的时钟
    Cont,
}

/// 每种媒体类型当前绑定的流以及时间戳记账
#[derive(Debug, Clone)]
pub struct CurrentStream {
    pub stream_type: StreamType,
    pub id: Option<i32>,
    pub source: Option<StreamSource>,
    /// 最近的解码时间戳（已修正）
    pub dts: Option<i64>,
    /// 最近的显示时间戳（已修正）
    pub pts: Option<i64>,
    /// 连续性检查记录的上一个 DTS
    pub last_dts: Option<i64>,
    /// 平均包时长
    pub dur: i64,
    /// Seek 目标：之前的包全部丢弃
    pub start_pts: Option<i64>,
    pub packets: u64,
    pub inited: bool,
    pub sync_state: SyncState,
    pub avsync: AvSync,
    /// 打开时的格式变更计数
    pub changes: u32,
    /// 打开管线时用的格式提示
    pub hint: Option<StreamInfo>,
    /// 管线上报的开始时间及缓冲时长
    pub start_time: Option<i64>,
    pub cache_time: i64,
    pub cache_total: i64,
}

impl CurrentStream {
    pub fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            id: None,
            source: None,
            dts: None,
            pts: None,
            last_dts: None,
            dur: DEFAULT_DURATION,
            start_pts: None,
            packets: 0,
            inited: false,
            sync_state: SyncState::Starting,
            avsync: AvSync::None,
            changes: 0,
            hint: None,
            start_time: None,
            cache_time: 0,
            cache_total: 0,
        }
    }

    /// 回到未绑定状态
    pub fn clear(&mut self) {
        *self = Self::new(self.stream_type);
    }

    /// 绑定了流
    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_bound_to(&self, source: StreamSource, id: i32) -> bool {
        self.source == Some(source) && self.id == Some(id)
    }

    /// 当前包的结束时间
    pub fn dts_end(&self) -> Option<i64> {
        self.dts.map(|dts| dts + self.dur)
    }

    /// 用新包更新 dts / pts 和平均时长
    pub fn update_timestamps(&mut self, packet: &DemuxPacket) {
        let dts = packet.dts.or(packet.pts).or(self.dts);

        if let Some(duration) = packet.duration {
            self.dur = duration;
        } else if let (Some(new), Some(old)) = (dts, self.dts) {
            self.dur = (self.dur * 9 + (new - old)) / 10;
        }

        self.dts = dts;
        if packet.pts.is_some() {
            self.pts = packet.pts;
        }
    }

    /// 管线上报 Started 之后记录的开始信息
    pub fn set_started(&mut self, timestamp: Option<i64>, cache_time: i64, cache_total: i64) {
        self.start_time = timestamp;
        self.cache_time = cache_time;
        self.cache_total = cache_total;
        self.sync_state = SyncState::WaitSync;
    }

    /// Flush 后重置时间戳记账
    pub fn reset_timestamps(&mut self) {
        self.dts = None;
        self.pts = None;
        self.start_pts = None;
        self.packets = 0;
    }
}

/// 所有媒体类型的 CurrentStream
#[derive(Debug, Clone)]
pub struct CurrentStreams {
    streams: [CurrentStream; 5],
}

impl CurrentStreams {
    pub fn new() -> Self {
        Self {
            streams: StreamType::ALL.map(CurrentStream::new),
        }
    }

    pub fn get(&self, stream_type: StreamType) -> &CurrentStream {
        &self.streams[stream_type.index()]
    }

    pub fn get_mut(&mut self, stream_type: StreamType) -> &mut CurrentStream {
        &mut self.streams[stream_type.index()]
    }

    pub fn audio(&self) -> &CurrentStream {
        self.get(StreamType::Audio)
    }

    pub fn video(&self) -> &CurrentStream {
        self.get(StreamType::Video)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CurrentStream> {
        self.streams.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CurrentStream> {
        self.streams.iter_mut()
    }

    /// 哪种媒体类型绑定了这个流
    pub fn find_bound(&self, source: StreamSource, id: i32) -> Option<StreamType> {
        self.streams
            .iter()
            .find(|s| s.is_bound_to(source, id))
            .map(|s| s.stream_type)
    }
}

impl Default for CurrentStreams {
    fn default() -> Self {
        Self::new()
    }
}
