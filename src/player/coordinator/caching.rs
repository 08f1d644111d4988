/// 缓冲状态
///
/// `Flush` 只是一个请求，设置时立即落到 `WaitFill`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingState {
    Done,
    Flush,
    /// 填充队列，直到管线不再接收数据或所有流都已开始输出
    WaitFill,
    /// 等所有音视频流离开 Starting
    WaitStream,
    /// 时钟已恢复，等管线真正开始输出
    WaitCodec,
}

impl CachingState {
    pub fn resolve(self) -> Self {
        match self {
            CachingState::Flush => CachingState::WaitFill,
            other => other,
        }
    }

    /// 这两个状态下时钟和音视频管线暂停
    pub fn pauses_clock(self) -> bool {
        matches!(self, CachingState::WaitFill | CachingState::WaitStream)
    }

    pub fn is_caching(self) -> bool {
        self != CachingState::Done
    }
}

/// 一路音视频流在转换函数里需要的信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachingView {
    pub starting: bool,
    pub accepts_data: bool,
    pub stalled: bool,
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CachingInputs {
    pub audio: Option<CachingView>,
    pub video: Option<CachingView>,
    /// 进入 WaitFill / WaitStream 时设置的截止时间已过
    pub timed_out: bool,
}

impl CachingInputs {
    fn views(&self) -> impl Iterator<Item = &CachingView> {
        self.audio.iter().chain(self.video.iter())
    }

    fn any_refuses_data(&self) -> bool {
        self.views().any(|p| !p.accepts_data)
    }

    fn all_started(&self) -> bool {
        self.views().all(|p| !p.starting)
    }

    /// 没有包的流不算（它永远不会开始输出）
    fn all_flowing(&self) -> bool {
        self.views().all(|p| p.packets == 0 || !p.stalled)
    }

    fn has_both(&self) -> bool {
        self.audio.is_some() && self.video.is_some()
    }

    fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// 缓冲状态机的转换函数
///
/// 只要还有流处于 Starting，状态就必须经过 WaitStream → WaitCodec，
/// 不会从 WaitFill 或 WaitStream 直接跳到后面。
pub fn next_state(state: CachingState, inputs: &CachingInputs) -> CachingState {
    match state {
        CachingState::Flush => CachingState::WaitFill,
        CachingState::Done => CachingState::Done,
        CachingState::WaitFill => {
            if inputs.is_empty() {
                return CachingState::Done;
            }
            if inputs.all_started() {
                CachingState::WaitCodec
            } else if inputs.any_refuses_data() || inputs.timed_out {
                CachingState::WaitStream
            } else {
                CachingState::WaitFill
            }
        }
        CachingState::WaitStream => {
            if inputs.all_started() {
                CachingState::WaitCodec
            } else if inputs.has_both() && inputs.any_refuses_data() && inputs.timed_out {
                // 一路流一直没有数据：不再等它
                CachingState::WaitCodec
            } else {
                CachingState::WaitStream
            }
        }
        CachingState::WaitCodec => {
            if inputs.all_flowing() || inputs.timed_out {
                CachingState::Done
            } else {
                CachingState::WaitCodec
            }
        }
    }
}
