use crate::core::{Chapter, DemuxPacket, Result, StreamInfo, StreamSource};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// 数据源能力，打开时确定一次，之后不再探测
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCaps {
    pub seekable: bool,
    pub pausable: bool,
    /// 直播 / 实时源：不能等，缓冲不足时调整速度或整体重同步
    pub realtime: bool,
    /// 有交互菜单（DVD / 蓝光导航）
    pub menu: bool,
}

/// 解封装数据源抽象接口
///
/// 不同的媒体源（本地文件、网络流、外挂字幕、合成测试源等）实现这个接口。
/// 时间戳统一为微秒。
pub trait Source: Send {
    /// 读取下一个数据包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<DemuxPacket>>;

    /// 按 ID 获取流信息
    fn stream(&self, id: i32) -> Option<StreamInfo>;

    /// 所有流
    fn streams(&self) -> Vec<StreamInfo>;

    /// Seek 到指定位置（毫秒）；成功时返回实际落点（微秒），不知道时为 None
    fn seek_time(&mut self, time_ms: i64, backward: bool) -> Result<Option<i64>>;

    /// 总时长（毫秒）
    fn stream_length(&self) -> i64;

    fn chapters(&self) -> Vec<Chapter> {
        Vec::new()
    }

    fn caps(&self) -> SourceCaps;

    /// 当前是否停在菜单里
    fn in_menu(&self) -> bool {
        false
    }

    /// 这个数据源产生的流在选择表里的来源标记
    fn origin(&self) -> StreamSource {
        StreamSource::Demux
    }

    /// 关联中止标志；阻塞读取时应检查它
    fn attach_abort(&mut self, _abort: Arc<AtomicBool>) {}

    /// 描述信息（用于日志）
    fn description(&self) -> String;
}
