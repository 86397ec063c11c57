use std::io;
use std::sync::Arc;

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::logger::Core;
use crate::verbosity::Verbosity;

/// `tracing-subscriber`の出力先
///
/// 1つのイベントを1件のレコードとして、書き込みスレッドのキューに追加する。
/// イベントは`tracing-subscriber`が書式化したまま出力し、ヘッダは付けない。
#[derive(Clone)]
pub struct RollingAppender {
    core: Arc<Core>,
}

/// 1つのイベントを書き込むライター
///
/// 破棄されたときに、書き込まれたバイト列をキューに追加する。
pub struct EventWriter<'a> {
    core: &'a Core,
    /// `None`の場合は出力しない
    verbosity: Option<Verbosity>,
    buffer: Vec<u8>,
}

impl RollingAppender {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    fn writer(&self, verbosity: Option<Verbosity>) -> EventWriter<'_> {
        let verbosity = verbosity.filter(|v| self.core.is_enabled(*v));
        EventWriter {
            core: &self.core,
            verbosity,
            buffer: Vec::new(),
        }
    }
}

/// イベントのレベルをレコードのレベルに変換する。
///
/// # 引数
///
/// * level: イベントのレベル。
///
/// # 戻り値
///
/// レコードのレベル。`DEBUG`と`TRACE`は`Verbosity::DEBUG`になる。
pub fn verbosity_for(level: &Level) -> Verbosity {
    match *level {
        Level::ERROR => Verbosity::ERROR,
        Level::WARN => Verbosity::WARNING,
        Level::INFO => Verbosity::INFO,
        _ => Verbosity::DEBUG,
    }
}

impl<'a> MakeWriter<'a> for RollingAppender {
    type Writer = EventWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Some(Verbosity::INFO))
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        // ロガー自身の診断は出力先に戻さない
        if meta.target().starts_with("restricted_rolling_logger") {
            return self.writer(None);
        }
        self.writer(Some(verbosity_for(meta.level())))
    }
}

impl io::Write for EventWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.verbosity.is_some() {
            self.buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter<'_> {
    fn drop(&mut self) {
        if self.verbosity.is_none() || self.buffer.is_empty() {
            return;
        }
        let record = String::from_utf8_lossy(&self.buffer).into_owned();
        self.core.enqueue(record);
    }
}
