use super::messages::Command;
use super::{Coordinator, SessionOptions, SessionShared};
use crate::core::{PlayState, PlayerError, Result, SeekRequest, SessionOutcome, StreamType};
use crate::player::log_ctx;
use crate::player::pipeline::{PipelineContext, PipelineSet};
use crate::player::registry::SelectionStream;
use crate::player::source::Source;
use crate::player::source_factory::SourceFactory;
use crossbeam_channel::{unbounded, Sender};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// 播放会话句柄（UI 侧接口）
///
/// 所有命令都是异步的：放进协调器的命令队列后立即返回，
/// 结果通过 `play_state()` 轮询或完成回调得到。
pub struct PlayerHandle {
    commands_tx: Sender<Command>,
    shared: SessionShared,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlayerHandle {
    /// 用已经打开的数据源启动会话
    pub fn spawn<B, C>(
        source: Box<dyn Source>,
        options: SessionOptions,
        build_pipelines: B,
        on_complete: C,
    ) -> Result<Self>
    where
        B: FnOnce(PipelineContext) -> PipelineSet + Send + 'static,
        C: FnOnce(SessionOutcome) + Send + 'static,
    {
        Self::start(options, move |_abort: &AtomicBool| Ok(source), build_pipelines, on_complete)
    }

    /// 在协调器线程里按重试配置打开数据源后启动会话
    pub fn open<O, B, C>(
        options: SessionOptions,
        opener: O,
        build_pipelines: B,
        on_complete: C,
    ) -> Result<Self>
    where
        O: FnMut(u32) -> Result<Box<dyn Source>> + Send + 'static,
        B: FnOnce(PipelineContext) -> PipelineSet + Send + 'static,
        C: FnOnce(SessionOutcome) + Send + 'static,
    {
        let retry = options.settings.open_retry.clone();
        Self::start(
            options,
            move |abort: &AtomicBool| SourceFactory::open_with_retry(&retry, abort, opener),
            build_pipelines,
            on_complete,
        )
    }

    fn start<S, B, C>(
        options: SessionOptions,
        open_source: S,
        build_pipelines: B,
        on_complete: C,
    ) -> Result<Self>
    where
        S: FnOnce(&AtomicBool) -> Result<Box<dyn Source>> + Send + 'static,
        B: FnOnce(PipelineContext) -> PipelineSet + Send + 'static,
        C: FnOnce(SessionOutcome) + Send + 'static,
    {
        let shared = SessionShared::new();
        let (commands_tx, commands_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let context = PipelineContext {
            clock: shared.clock.clone(),
            events: events_tx,
            settings: options.settings.clone(),
        };

        let session = shared.clone();
        let thread_handle = thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || {
                let outcome = match open_source(&session.abort) {
                    Ok(source) => {
                        let pipelines = build_pipelines(context);
                        Coordinator::new(source, pipelines, session, options, commands_rx, events_rx)
                            .run()
                    }
                    Err(PlayerError::Aborted) => SessionOutcome::Stopped,
                    Err(e) => {
                        error!("{} ❌ 无法打开数据源: {}", log_ctx(), e);
                        SessionOutcome::Failed(e)
                    }
                };
                on_complete(outcome);
            })?;

        info!("{} 🚀 协调器线程已启动", log_ctx());
        Ok(Self {
            commands_tx,
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    fn send(&self, command: Command) {
        let name = command.name();
        if self.commands_tx.send(command).is_err() {
            warn!("{} ⚠️ 播放会话已结束，命令 {} 被丢弃", log_ctx(), name);
        }
    }

    pub fn seek(&self, request: SeekRequest) {
        self.send(Command::Seek(request));
    }

    pub fn seek_chapter(&self, chapter: usize) {
        self.send(Command::SeekChapter(chapter));
    }

    pub fn set_speed(&self, speed: i32) {
        self.send(Command::SetSpeed(speed));
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn select_stream(&self, stream_type: StreamType, index: usize) {
        self.send(Command::SelectStream { stream_type, index });
    }

    pub fn set_subtitle_visible(&self, visible: bool) {
        self.send(Command::SetSubtitleVisible(visible));
    }

    pub fn add_subtitle_source(&self, source: Box<dyn Source>) {
        self.send(Command::AddSubtitleSource(source));
    }

    /// 最近一次的状态快照
    pub fn play_state(&self) -> PlayState {
        self.shared.play_state.read().clone()
    }

    /// 某类型的所有可选流（菜单用）
    pub fn streams(&self, stream_type: StreamType) -> Vec<SelectionStream> {
        self.shared.registry.lock().streams(stream_type)
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// 请求停止（不等待）
    pub fn stop(&self) {
        info!("{} ⏹️ 请求停止播放", log_ctx());
        self.shared.abort.store(true, Ordering::SeqCst);
    }

    /// 等协调器线程结束
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 协调器线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        if !self.is_finished() {
            warn!("{} ⚠ PlayerHandle 被 drop 时会话仍在运行，正在停止", log_ctx());
            self.stop();
        }
        self.join();
    }
}
