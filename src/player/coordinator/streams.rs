//! 选流、打开 / 关闭流、格式变化与外挂字幕

use super::caching::CachingState;
use super::messages::Command;
use super::{Coordinator, Sidecar};
use crate::core::{time_to_msec, SeekRequest, StreamInfo, StreamSource, StreamType};
use crate::player::current_stream::{AvSync, SyncState};
use crate::player::log_ctx;
use crate::player::pipeline::PipelineMessage;
use crate::player::ranking::{compare_by_index, compare_video, AudioRanking, SubtitleRanking};
use crate::player::registry::SelectionStream;
use crate::player::source::Source;
use log::{debug, info, warn};

impl Coordinator {
    pub(super) fn register_streams(&mut self, origin: StreamSource, streams: &[StreamInfo]) {
        let mut registry = self.shared.registry.lock();
        for info in streams {
            if let Some(stream) = SelectionStream::from_info(origin, info) {
                registry.update(stream);
            }
        }
    }

    /// 按来源查流信息（打开管线时的格式提示）
    pub(super) fn stream_info(&self, origin: StreamSource, id: i32) -> Option<StreamInfo> {
        if origin == StreamSource::VideoMux {
            return self.caption_streams.iter().find(|s| s.id == id).cloned();
        }
        match &self.sidecar {
            Some(sidecar) if sidecar.origin == origin => sidecar.source.stream(id),
            _ => self.source.stream(id),
        }
    }

    /// 包属于哪个已绑定的媒体类型；顺带处理格式变化和新出现的流
    pub(super) fn resolve_stream(&mut self, origin: StreamSource, id: i32) -> Option<StreamType> {
        if let Some(stream_type) = self.current.find_bound(origin, id) {
            self.check_format_change(stream_type, origin, id);
            return Some(stream_type);
        }

        let info = self.stream_info(origin, id)?;
        let stream_type = info.stream_type?;
        let known = self
            .shared
            .registry
            .lock()
            .find(stream_type, origin, id)
            .is_some();
        if !known {
            info!(
                "{} ➕ 播放中出现新的 {} 流: source={:?} id={}",
                log_ctx(),
                stream_type.as_str(),
                origin,
                id
            );
            self.register_streams(origin, std::slice::from_ref(&info));
            if !self.current.get(stream_type).is_active() {
                self.open_default_stream(stream_type);
            }
        }
        self.current.find_bound(origin, id)
    }

    fn check_format_change(&mut self, stream_type: StreamType, origin: StreamSource, id: i32) {
        let Some(info) = self.stream_info(origin, id) else {
            return;
        };
        let current = self.current.get(stream_type);
        if info.changes == current.changes {
            return;
        }
        let differs = current.hint.as_ref().map_or(true, |hint| {
            let mut hint = hint.clone();
            hint.changes = info.changes;
            hint != info
        });
        if differs {
            info!(
                "{} 🔄 {} 流 {} 格式变化（第 {} 次），重新打开",
                log_ctx(),
                stream_type.as_str(),
                id,
                info.changes
            );
            self.register_streams(origin, std::slice::from_ref(&info));
            self.open_stream(stream_type, origin, id, false);
        }
        self.current.get_mut(stream_type).changes = info.changes;
    }

    /// 打开（或复用）流；失败时永久禁用该流
    pub(super) fn open_stream(
        &mut self,
        stream_type: StreamType,
        origin: StreamSource,
        id: i32,
        reset: bool,
    ) -> bool {
        if self.disabled.contains(&(origin, id)) {
            debug!("{} 🚫 流 {:?}/{} 已禁用", log_ctx(), origin, id);
            return false;
        }
        let Some(hint) = self.stream_info(origin, id) else {
            warn!("{} ⚠️ 找不到流信息: {:?}/{}", log_ctx(), origin, id);
            return false;
        };
        let speed = self.stream_player_speed;
        let current = self.current.get(stream_type);
        let hint_changed = current.hint.as_ref() != Some(&hint);
        let was_active = current.is_active();

        let Some(pipeline) = self.pipelines.get_mut(stream_type) else {
            debug!("{} 没有 {} 管线，跳过", log_ctx(), stream_type.as_str());
            return false;
        };

        let needs_open = !was_active || hint_changed || !pipeline.is_active();
        if needs_open {
            if let Err(e) = pipeline.open_stream(&hint) {
                warn!(
                    "{} ❌ 打开 {} 流 {:?}/{} 失败，已禁用: {}",
                    log_ctx(),
                    stream_type.as_str(),
                    origin,
                    id,
                    e
                );
                let pipeline_active = pipeline.is_active();
                self.disabled.insert((origin, id));
                if !pipeline_active && was_active {
                    self.close_stream(stream_type, false);
                }
                return false;
            }
            pipeline.set_speed(speed);
            let current = self.current.get_mut(stream_type);
            current.sync_state = SyncState::Starting;
            current.packets = 0;
        } else if reset {
            if let Err(e) = pipeline.send_message(PipelineMessage::Reset) {
                warn!("{} ⚠️ 重置 {} 管线失败: {}", log_ctx(), stream_type.as_str(), e);
            }
        }

        let other_playing = self.other_av_in_sync(stream_type);
        let current = self.current.get_mut(stream_type);
        current.id = Some(id);
        current.source = Some(origin);
        current.changes = hint.changes;
        current.last_dts = None;
        if needs_open && current.avsync != AvSync::Force {
            // 另一路还在播放：等连续性确认后单独同步，否则整体同步
            current.avsync = if other_playing { AvSync::Check } else { AvSync::Force };
        }
        info!(
            "{} 🎵 打开 {} 流: source={:?} id={} codec={} lang={}",
            log_ctx(),
            stream_type.as_str(),
            origin,
            id,
            hint.codec,
            hint.language
        );
        current.hint = Some(hint);
        true
    }

    /// 另一路音视频流已经按时钟在播放
    fn other_av_in_sync(&self, stream_type: StreamType) -> bool {
        let other = match stream_type {
            StreamType::Audio => StreamType::Video,
            StreamType::Video => StreamType::Audio,
            _ => return false,
        };
        let current = self.current.get(other);
        current.is_active() && current.sync_state == SyncState::InSync
    }

    /// 关闭流；`wait` 为真时等管线把队列输出完
    pub(super) fn close_stream(&mut self, stream_type: StreamType, wait: bool) {
        if !self.current.get(stream_type).is_active() {
            return;
        }
        info!(
            "{} 🛑 关闭 {} 流（wait={}）",
            log_ctx(),
            stream_type.as_str(),
            wait
        );
        if wait {
            self.set_caching(CachingState::Done);
        }
        if let Some(pipeline) = self.pipelines.get_mut(stream_type) {
            pipeline.close_stream(wait);
        }
        self.current.get_mut(stream_type).clear();
    }

    pub(super) fn open_default_streams(&mut self) {
        for stream_type in StreamType::ALL {
            self.open_default_stream(stream_type);
        }
    }

    /// 按默认规则选出该类型最合适的流并打开
    pub(super) fn open_default_stream(&mut self, stream_type: StreamType) {
        if !self.pipelines.contains(stream_type) {
            debug!("{} 没有 {} 管线，不选流", log_ctx(), stream_type.as_str());
            return;
        }
        if stream_type == StreamType::Subtitle
            && self.current.get(stream_type).source == Some(StreamSource::VideoMux)
        {
            self.close_stream(stream_type, false);
        }

        let candidates = self.ranked_candidates(stream_type);
        for (candidate, visible) in candidates {
            if self.disabled.contains(&(candidate.source, candidate.id)) {
                continue;
            }
            if self.open_stream(stream_type, candidate.source, candidate.id, true) {
                if stream_type == StreamType::Subtitle {
                    self.subtitle_visible = visible;
                }
                return;
            }
        }

        let is_av = matches!(stream_type, StreamType::Audio | StreamType::Video);
        self.close_stream(stream_type, is_av);
    }

    /// 在流表锁内排序并算好字幕可见性
    fn ranked_candidates(&self, stream_type: StreamType) -> Vec<(SelectionStream, bool)> {
        let current = self.current.get(stream_type);
        let previous = current.source.zip(current.id);
        let registry = self.shared.registry.lock();

        match stream_type {
            StreamType::Video => registry
                .get_sorted(stream_type, compare_video)
                .into_iter()
                .map(|s| (s, true))
                .collect(),
            StreamType::Audio => {
                let ranking = AudioRanking::new(&self.settings, previous);
                registry
                    .get_sorted(stream_type, |a, b| ranking.compare(a, b))
                    .into_iter()
                    .map(|s| (s, true))
                    .collect()
            }
            StreamType::Subtitle => {
                let audio = self.current.audio();
                let audio_language = match (audio.source, audio.id) {
                    (Some(source), Some(id)) => registry
                        .find(StreamType::Audio, source, id)
                        .map(|s| s.language.clone())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                let ranking = SubtitleRanking::new(&self.settings, previous, &audio_language);
                registry
                    .get_sorted(stream_type, |a, b| ranking.compare(a, b))
                    .into_iter()
                    .map(|s| {
                        let visible = ranking.visible(&s);
                        (s, visible)
                    })
                    .collect()
            }
            StreamType::Teletext | StreamType::DataService => registry
                .get_sorted(stream_type, compare_by_index)
                .into_iter()
                .map(|s| (s, true))
                .collect(),
        }
    }

    /// 用户按序号切换流
    pub(super) fn select_stream(&mut self, stream_type: StreamType, index: usize) {
        let Some(stream) = self.shared.registry.lock().get(stream_type, index).cloned() else {
            warn!(
                "{} ⚠️ 没有 {} 流 #{}",
                log_ctx(),
                stream_type.as_str(),
                index
            );
            return;
        };
        if self.current.get(stream_type).is_bound_to(stream.source, stream.id) {
            return;
        }
        info!(
            "{} 🔀 切换 {} 流 -> #{} ({} {})",
            log_ctx(),
            stream_type.as_str(),
            index,
            stream.language,
            stream.codec
        );

        self.close_stream(stream_type, false);
        let opened = self.open_stream(stream_type, stream.source, stream.id, false);
        match stream_type {
            StreamType::Audio | StreamType::Video if opened && self.caps.seekable => {
                // 新流从当前位置开始：精确 Seek 后整体重新同步
                let time_ms = self.display_time_ms(self.shared.clock.now());
                self.internal.push_back(Command::Seek(SeekRequest {
                    backward: true,
                    ..SeekRequest::to(time_ms)
                }));
            }
            StreamType::Subtitle if opened => self.subtitle_visible = true,
            _ => {}
        }
        self.update_play_state(true);
    }

    /// 挂上外挂字幕数据源，并切到它的第一个字幕流
    pub(super) fn add_sidecar(&mut self, mut source: Box<dyn Source>) {
        let origin = source.origin();
        info!(
            "{} 📝 加载外挂字幕: {} ({:?})",
            log_ctx(),
            source.description(),
            origin
        );
        source.attach_abort(self.shared.abort.clone());

        if self.current.get(StreamType::Subtitle).source == Some(origin) {
            self.close_stream(StreamType::Subtitle, false);
        }
        let position_ms = time_to_msec(self.shared.clock.now() + self.offset_pts);
        if let Err(e) = source.seek_time(position_ms.max(0), true) {
            debug!("{} 外挂字幕无法定位到 {}ms: {}", log_ctx(), position_ms, e);
        }

        let streams = source.streams();
        self.shared.registry.lock().clear(None, Some(origin));
        self.register_streams(origin, &streams);
        self.sidecar = Some(Sidecar {
            source,
            origin,
            pending: None,
            eof: false,
        });

        let first = streams
            .iter()
            .find(|s| s.stream_type == Some(StreamType::Subtitle))
            .map(|s| s.id);
        if let Some(id) = first {
            if self.open_stream(StreamType::Subtitle, origin, id, true) {
                self.subtitle_visible = true;
            }
        }
        self.update_play_state(true);
    }
}
