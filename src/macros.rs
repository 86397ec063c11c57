//! レコードを出力するマクロ
//!
//! マクロの第1引数はロガーで、呼び出し元の位置は`location!`で取得する。
//!
//! ```no_run
//! use restricted_rolling_logger::{log_info, LogConfig, Logger};
//!
//! let logger = Logger::new(LogConfig::new("/var/log/app", "app.log")).unwrap();
//! log_info!(logger, "started with {} workers", 4);
//! ```

/// `type_name`で取得した関数内のアイテムのパスから、関数のパスを取り出す。
#[doc(hidden)]
pub fn function_path(item_path: &'static str) -> &'static str {
    let mut path = item_path.strip_suffix("::__caller").unwrap_or(item_path);
    while let Some(stripped) = path.strip_suffix("::{{closure}}") {
        path = stripped;
    }
    path
}

#[doc(hidden)]
pub fn type_name_of<T>(_: T) -> &'static str {
    std::any::type_name::<T>()
}

/// 呼び出し元の`Location`を作成する。
///
/// 呼び出し元のアドレスは、呼び出し元に定義した関数のアドレスで、呼び出し元と同じモジュールにある。
#[macro_export]
macro_rules! location {
    () => {{
        fn __caller() {}
        $crate::Location::new(
            __caller as usize,
            $crate::macros::function_path($crate::macros::type_name_of(__caller)),
            file!(),
            line!(),
        )
    }};
}

/// 指定したレベルのレコードを出力する。
#[macro_export]
macro_rules! log {
    ($logger:expr, $verbosity:expr, $($arg:tt)+) => {{
        let logger = &$logger;
        let verbosity = $verbosity;
        if logger.is_enabled(verbosity) {
            logger.log(verbosity, &$crate::location!(), ::std::format_args!($($arg)+));
        }
    }};
}

#[macro_export]
macro_rules! log_fatal {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Verbosity::FATAL, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Verbosity::ERROR, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Verbosity::WARNING, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Verbosity::INFO, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log!($logger, $crate::Verbosity::DEBUG, $($arg)+)
    };
}

/// バイト列の16進ダンプを出力する。
#[macro_export]
macro_rules! log_binary {
    ($logger:expr, $verbosity:expr, $data:expr) => {
        $logger.log_binary($verbosity, &$crate::location!(), $data)
    };
}

/// 呼び出したスレッドのスタックトレースを出力する。
#[macro_export]
macro_rules! log_stack_trace {
    ($logger:expr, $verbosity:expr) => {
        $logger.log_stack_trace($verbosity, &$crate::location!())
    };
}

/// ロード済みモジュールの一覧を出力する。
#[macro_export]
macro_rules! log_modules {
    ($logger:expr, $verbosity:expr) => {
        $logger.log_modules($verbosity, &$crate::location!())
    };
}
