use std::collections::VecDeque;

/// 历史样本个数
pub const SMOOTHER_SAMPLES: usize = 5;

/// 线性加权移动平均
///
/// 第 i 个（从最旧开始，1 起计）样本权重为 i，整体乘 2/(n(n+1)) 归一化。
/// 缓冲重新填满时延迟会突变，线性权重比指数平滑的过冲更小。
#[derive(Debug, Clone)]
pub struct DelaySmoother {
    history: VecDeque<f64>,
    capacity: usize,
}

impl DelaySmoother {
    pub fn new() -> Self {
        Self::with_capacity(SMOOTHER_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// 加入一个样本，返回平滑后的值
    pub fn add(&mut self, sample: f64) -> f64 {
        self.history.push_back(sample);
        if self.history.len() > self.capacity {
            self.history.pop_front();
        }
        self.value()
    }

    /// 当前平滑值（没有样本时为 0）
    pub fn value(&self) -> f64 {
        let n = self.history.len();
        if n == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .history
            .iter()
            .enumerate()
            .map(|(i, sample)| (i + 1) as f64 * sample)
            .sum();
        weighted * 2.0 / (n * (n + 1)) as f64
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for DelaySmoother {
    fn default() -> Self {
        Self::new()
    }
}
