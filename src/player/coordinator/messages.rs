use crate::core::{SeekRequest, StreamType};
use crate::player::source::Source;

/// UI 发给协调器的命令
pub enum Command {
    Seek(SeekRequest),
    /// 跳到第 n 章（从 1 开始）
    SeekChapter(usize),
    SetSpeed(i32),
    Pause,
    Resume,
    /// 按类型内序号切换流
    SelectStream {
        stream_type: StreamType,
        index: usize,
    },
    SetSubtitleVisible(bool),
    /// 挂上一个外挂字幕数据源
    AddSubtitleSource(Box<dyn Source>),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Seek(_) => "Seek",
            Command::SeekChapter(_) => "SeekChapter",
            Command::SetSpeed(_) => "SetSpeed",
            Command::Pause => "Pause",
            Command::Resume => "Resume",
            Command::SelectStream { .. } => "SelectStream",
            Command::SetSubtitleVisible(_) => "SetSubtitleVisible",
            Command::AddSubtitleSource(_) => "AddSubtitleSource",
        }
    }

    pub fn is_seek(&self) -> bool {
        matches!(self, Command::Seek(_) | Command::SeekChapter(_))
    }
}

/// Seek 合并：同一批命令里只保留最后一个 Seek / SeekChapter
///
/// 其余命令保持原顺序。
pub fn coalesce(commands: Vec<Command>) -> Vec<Command> {
    let Some(last_seek) = commands.iter().rposition(Command::is_seek) else {
        return commands;
    };
    commands
        .into_iter()
        .enumerate()
        .filter(|(i, command)| !command.is_seek() || *i == last_seek)
        .map(|(_, command)| command)
        .collect()
}
