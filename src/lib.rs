//! 播放器同步核心
//!
//! 选流、时间戳连续性检查、缓冲与同步状态机、共享时钟以及音频延迟估计。

pub mod core;
pub mod player;
