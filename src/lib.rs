//! Restricted Rolling Logger
//!
//! ----------------------------------------------------------------------------
//!
//! このクレートは、プロセスに組み込んで使用するロガーである。
//! アプリケーションが出力したレコードは、バックグラウンドの書き込みスレッドが
//! サイズでローテーションするファイルに書き込む。
//!
//! `Logger`は、以下の機能を持つ。
//!
//! - 書式を指定できるヘッダ（日時、レベル、プロセスID、スレッドID、モジュール、関数など）
//! - 指定されたサイズを超える前に、ファイルを`{file_name}.1`、`{file_name}.2`、...に
//!   切り替え、残す最大ファイル数を超えたファイルを削除するローテーション
//! - シグナル（SIGSEGV、SIGBUS、SIGILL、SIGFPE、SIGABRT）とパニックの捕捉と、
//!   スタックトレースの出力
//! - 固定アドレスの共有領域を通じた、同じプロセスに読み込まれたモジュール間での
//!   インスタンスの共有
//! - `tracing-subscriber`の出力先として使用できる`RollingAppender`
//!
//! ログの出力に失敗しても、アプリケーションにエラーは返さない。

pub mod appenders;
pub mod config;
pub mod crash;
pub mod error;
pub mod header;
pub mod logger;
#[doc(hidden)]
pub mod macros;
pub mod module_resolver;
pub mod probe;
pub mod record;
pub mod rotation;
pub mod singleton;
pub mod sink;
pub mod stacktrace;
pub mod verbosity;
pub mod writer;

pub use appenders::RollingAppender;
pub use config::{ConfigProvider, LogConfig, SharedConfig, SharingMode, WriteMode};
pub use crash::FaultDescription;
pub use error::{Error, Result};
pub use logger::Logger;
pub use record::Location;
pub use sink::RecordSink;
pub use verbosity::Verbosity;
