//! 会话监管：当前任务的取消令牌
//!
//! 每次运行开始时换上新的 CancellationToken，`cancel()` 只作用于正在运行的任务，
//! 上一次取消不会影响下一次运行。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一次运行，返回本次运行的令牌
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    /// 取消当前运行（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_affects_current_run() {
        let sup = SessionSupervisor::new();
        let first = sup.begin();
        sup.cancel();
        assert!(first.is_cancelled());
        assert!(sup.is_cancelled());

        let second = sup.begin();
        assert!(!second.is_cancelled());
        assert!(!sup.is_cancelled());
    }
}
