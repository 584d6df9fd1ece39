//! 可观测性：tracing 订阅器初始化
//!
//! `RUST_LOG` 优先；未设置时使用配置中的 `log.level`。`json = true` 时输出 JSON 行，
//! 便于与工具审计记录一起采集。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogSection;

/// 构建日志过滤器：环境变量优先，其次是配置的级别，级别无法解析时退回 info
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器；重复调用时保留第一次的设置
pub fn init(log: &LogSection) {
    let registry = tracing_subscriber::registry().with(env_filter(&log.level));
    let result = if log.json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).try_init()
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let log = LogSection::default();
        init(&log);
        init(&LogSection {
            level: "debug".into(),
            json: true,
        });
        tracing::info!(check = true, "still logging");
    }

    #[test]
    fn test_bad_level_falls_back() {
        let filter = env_filter("not a [valid directive");
        assert!(!filter.to_string().is_empty());
    }
}
