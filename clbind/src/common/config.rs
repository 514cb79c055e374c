use std::time::Duration;

/// 调用边界的配置。
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// 为真时，任何非成功的结果码都转换为 [`NativeCallFailure`](crate::ErrorKind::NativeCallFailure) 错误；
    /// 否则结果码原样返回给调用者。
    pub exceptions: bool,
}

/// 对齐分配的回收方式。
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Reclaim {
    /// 最后一个宿主引用释放时立即释放原生内存。
    #[default]
    Eager,
    /// 宿主引用释放后只登记到回收通道，由 [`sweep`](crate::Tracker::sweep) 释放。
    Deferred,
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub reclaim: Reclaim,
    /// 后台回收任务轮询回收通道的间隔。
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reclaim: Reclaim::Eager,
            sweep_interval: Duration::from_millis(20),
        }
    }
}
