//! 日志系统模块，负责进程级的 tracing 初始化

use std::sync::Once;

use time::macros::format_description;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// 确保日志系统只初始化一次
static INIT: Once = Once::new();

/// Environment variable that overrides the CLI log level with a full filter.
pub const LOG_ENV: &str = "SSHKIT_LOG";

/// How the subscriber should be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

impl LogSettings {
    /// Build settings from the global CLI flags. `quiet` wins over `level`.
    pub fn from_flags(level: Level, quiet: bool, json: bool) -> Self {
        Self {
            level: if quiet { Level::ERROR } else { level },
            json,
        }
    }

    fn default_directive(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        format!("{level},sshkit={level}")
    }
}

/// Install the global subscriber. Only the first call has any effect.
///
/// `log` records (used by the key module and by russh) are bridged through
/// `tracing-log`, and everything is written to stderr so remote output on
/// stdout stays clean.
pub fn setup_logging(settings: &LogSettings) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(settings.default_directive()));
        let timer = UtcTime::new(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ));

        // 测试或宿主程序可能已经初始化过 LogTracer，忽略错误
        let _ = tracing_log::LogTracer::init();

        let registry = tracing_subscriber::registry().with(filter);
        let installed = if settings.json {
            tracing::subscriber::set_global_default(
                registry.with(
                    fmt::layer()
                        .json()
                        .with_timer(timer)
                        .with_writer(std::io::stderr),
                ),
            )
        } else {
            tracing::subscriber::set_global_default(
                registry.with(
                    fmt::layer()
                        .with_timer(timer)
                        .with_target(true)
                        .with_writer(std::io::stderr),
                ),
            )
        };

        if installed.is_ok() {
            tracing::debug!(
                "logging initialised [{} {}]",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            );
        }
    });
}
