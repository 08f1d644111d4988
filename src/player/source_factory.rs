use crate::core::{OpenRetryConfig, PlayerError, Result};
use crate::player::log_ctx;
use crate::player::source::Source;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// 数据源工厂：按重试配置打开数据源
///
/// 打开函数的参数是当前尝试次数（从 1 开始）。
/// 直播源等暂时不可用的数据源靠这里的有限重试等待，
/// 重试用完后返回 `SourceUnavailable`，播放会话随之结束。
pub struct SourceFactory;

impl SourceFactory {
    /// 在当前线程打开（阻塞，重试之间睡眠）
    pub fn open_with_retry<F>(
        config: &OpenRetryConfig,
        abort: &AtomicBool,
        mut open: F,
    ) -> Result<Box<dyn Source>>
    where
        F: FnMut(u32) -> Result<Box<dyn Source>>,
    {
        let max_attempts = config.max_attempts.max(1);
        let interval = Duration::from_millis(config.retry_interval_ms);

        for attempt in 1..=max_attempts {
            if abort.load(Ordering::SeqCst) {
                info!("{} ⏹ 打开数据源被中止", log_ctx());
                return Err(PlayerError::Aborted);
            }

            match open(attempt) {
                Ok(source) => {
                    info!(
                        "{} ✅ 数据源已打开: {}（第 {} 次尝试）",
                        log_ctx(),
                        source.description(),
                        attempt
                    );
                    return Ok(source);
                }
                Err(PlayerError::Aborted) => return Err(PlayerError::Aborted),
                Err(e) => {
                    warn!(
                        "{} 🔄 打开数据源失败 ({}/{}): {}",
                        log_ctx(),
                        attempt,
                        max_attempts,
                        e
                    );
                    if attempt < max_attempts {
                        Self::sleep_unless_aborted(interval, abort);
                    }
                }
            }
        }

        error!("{} ❌ 数据源不可用，已重试 {} 次", log_ctx(), max_attempts);
        Err(PlayerError::SourceUnavailable {
            attempts: max_attempts,
        })
    }

    fn sleep_unless_aborted(interval: Duration, abort: &AtomicBool) {
        const STEP: Duration = Duration::from_millis(10);
        let mut remaining = interval;
        while !remaining.is_zero() && !abort.load(Ordering::SeqCst) {
            let step = remaining.min(STEP);
            thread::sleep(step);
            remaining -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::synthetic::{SyntheticConfig, SyntheticSource};

    fn fast_retry(max_attempts: u32) -> OpenRetryConfig {
        OpenRetryConfig {
            max_attempts,
            retry_interval_ms: 1,
        }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let abort = AtomicBool::new(false);
        let source = SourceFactory::open_with_retry(&fast_retry(5), &abort, |attempt| {
            if attempt < 3 {
                Err(PlayerError::OpenError("直播源尚未就绪".to_string()))
            } else {
                Ok(Box::new(SyntheticSource::new(SyntheticConfig::default())) as Box<dyn Source>)
            }
        });
        assert!(source.is_ok());
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let abort = AtomicBool::new(false);
        let mut calls = 0;
        let result = SourceFactory::open_with_retry(&fast_retry(3), &abort, |_| {
            calls += 1;
            Err(PlayerError::OpenError("404".to_string()))
        });
        assert!(matches!(result, Err(PlayerError::SourceUnavailable { attempts: 3 })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_abort_stops_retrying() {
        let abort = AtomicBool::new(true);
        let result = SourceFactory::open_with_retry(&fast_retry(3), &abort, |_| {
            Err(PlayerError::OpenError("unreachable".to_string()))
        });
        assert!(matches!(result, Err(PlayerError::Aborted)));
    }
}
