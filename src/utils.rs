//! 工具函数和宏

/// Log a failed result and turn it into an [`anyhow::Error`] in one step.
///
/// The level defaults to `error`; pass `warn`, `info` or `debug` to pick
/// another one. A format string with arguments is accepted after the level.
///
/// ```
/// # use sshkit::try_log;
/// # fn example() -> anyhow::Result<()> {
/// let missing: Result<(), std::io::Error> =
///     Err(std::io::Error::from(std::io::ErrorKind::NotFound));
/// let res = try_log!(missing, warn, "reading {} failed", "known_hosts");
/// assert!(res.is_err());
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! try_log {
    ($e:expr, $msg:expr) => {
        $crate::try_log!($e, error, $msg)
    };

    ($e:expr, $level:ident, $msg:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                ::tracing::$level!("{}: {}", $msg, e);
                Err(::anyhow::anyhow!("{}: {}", $msg, e))
            }
        }
    };

    ($e:expr, $level:ident, $fmt:expr, $($arg:tt)*) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                let msg = format!($fmt, $($arg)*);
                ::tracing::$level!("{}: {}", msg, e);
                Err(::anyhow::anyhow!("{}: {}", msg, e))
            }
        }
    };
}
