use crate::core::{StreamFlags, StreamInfo, StreamSource, StreamType};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

/// 可选择的基本流（菜单里"音轨 2"之类的条目）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionStream {
    pub stream_type: StreamType,
    pub source: StreamSource,
    /// 数据源内部 ID
    pub id: i32,
    /// 同类型内的序号：第一次出现时分配，之后不变
    pub type_index: usize,
    pub language: String,
    pub name: String,
    pub codec: String,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub flags: StreamFlags,
    pub filename: Option<PathBuf>,
    /// 数据源断开后置为 false，条目保留
    pub valid: bool,
}

impl SelectionStream {
    /// 由数据源报告的流信息构造；没有类型的流不可选择
    pub fn from_info(source: StreamSource, info: &StreamInfo) -> Option<Self> {
        Some(Self {
            stream_type: info.stream_type?,
            source,
            id: info.id,
            type_index: 0,
            language: info.language.clone(),
            name: info.name.clone(),
            codec: info.codec.clone(),
            channels: info.channels,
            width: info.width,
            height: info.height,
            flags: info.flags,
            filename: info.filename.clone(),
            valid: true,
        })
    }

    pub fn matches(&self, stream_type: StreamType, source: StreamSource, id: i32) -> bool {
        self.stream_type == stream_type && self.source == source && self.id == id
    }
}

/// 流选择表
///
/// (type, source, id) 唯一；同类型序号稠密，按首次出现的顺序分配。
#[derive(Debug, Default)]
pub struct SelectionStreams {
    streams: Vec<SelectionStream>,
}

/// 会话内共享的流选择表
pub type SharedSelectionStreams = Arc<Mutex<SelectionStreams>>;

impl SelectionStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSelectionStreams {
        Arc::new(Mutex::new(Self::new()))
    }

    /// 插入或合并，返回该流的类型内序号
    pub fn update(&mut self, mut stream: SelectionStream) -> usize {
        if let Some(existing) = self
            .streams
            .iter_mut()
            .find(|s| s.matches(stream.stream_type, stream.source, stream.id))
        {
            stream.type_index = existing.type_index;
            stream.valid = true;
            *existing = stream;
            return existing.type_index;
        }

        // 失效的条目也占着序号，保证序号不会被复用
        stream.type_index = self
            .streams
            .iter()
            .filter(|s| s.stream_type == stream.stream_type)
            .count();
        stream.valid = true;
        debug!(
            "➕ 新{}流: source={:?} id={} index={} lang={}",
            stream.stream_type.as_str(),
            stream.source,
            stream.id,
            stream.type_index,
            stream.language
        );
        let index = stream.type_index;
        self.streams.push(stream);
        index
    }

    /// 让匹配的条目失效（None 表示任意）
    pub fn clear(&mut self, stream_type: Option<StreamType>, source: Option<StreamSource>) {
        for stream in self.streams.iter_mut() {
            let type_matches = stream_type.map_or(true, |t| stream.stream_type == t);
            let source_matches = source.map_or(true, |s| stream.source == s);
            if type_matches && source_matches {
                stream.valid = false;
            }
        }
    }

    /// 真正删除所有条目（会话结束或重建流表）
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    pub fn get(&self, stream_type: StreamType, index: usize) -> Option<&SelectionStream> {
        self.streams
            .iter()
            .find(|s| s.valid && s.stream_type == stream_type && s.type_index == index)
    }

    pub fn find(
        &self,
        stream_type: StreamType,
        source: StreamSource,
        id: i32,
    ) -> Option<&SelectionStream> {
        self.streams
            .iter()
            .find(|s| s.valid && s.matches(stream_type, source, id))
    }

    /// 按给定排序返回该类型的所有有效流
    pub fn get_sorted<F>(&self, stream_type: StreamType, ranking: F) -> Vec<SelectionStream>
    where
        F: Fn(&SelectionStream, &SelectionStream) -> Ordering,
    {
        let mut streams = self.streams(stream_type);
        streams.sort_by(|a, b| ranking(a, b));
        streams
    }

    /// 该类型的所有有效流（按序号）
    pub fn streams(&self, stream_type: StreamType) -> Vec<SelectionStream> {
        let mut streams: Vec<SelectionStream> = self
            .streams
            .iter()
            .filter(|s| s.valid && s.stream_type == stream_type)
            .cloned()
            .collect();
        streams.sort_by_key(|s| s.type_index);
        streams
    }

    pub fn index_of(&self, stream_type: StreamType, source: StreamSource, id: i32) -> Option<usize> {
        self.find(stream_type, source, id).map(|s| s.type_index)
    }

    pub fn count(&self, stream_type: StreamType) -> usize {
        self.streams
            .iter()
            .filter(|s| s.valid && s.stream_type == stream_type)
            .count()
    }
}
