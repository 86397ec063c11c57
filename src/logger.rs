//! ロガー
//!
//! `Logger`はレコードのヘッダを作成して、書き込みスレッドのキューに追加する。
//! ロガーの状態（設定、ヘッダのキャッシュ、モジュールのキャッシュ、書き込みスレッド）は
//! `Core`にまとめ、参照カウントで共有する。

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use time::{OffsetDateTime, UtcOffset};

use crate::appenders::RollingAppender;
use crate::config::{ConfigProvider, SharingMode};
use crate::crash::{self, CrashGuard, CrashSink, FaultDescription, PanicGuard};
use crate::error::Result;
use crate::header::{HeaderCache, HeaderContext};
use crate::module_resolver::{self, ModuleResolver};
use crate::record::{self, Location, LogRecord};
use crate::singleton::{ProcessAddressSpace, SingletonLocator};
use crate::sink::{FileSink, RecordSink, Sink};
use crate::stacktrace;
use crate::verbosity::Verbosity;
use crate::writer::Writer;

const TARGET: &str = "restricted_rolling_logger";

pub(crate) struct Core {
    config: Arc<dyn ConfigProvider>,
    header: HeaderCache,
    modules: ModuleResolver,
    writer: Writer,
    offset: UtcOffset,
}

impl Core {
    fn open(config: Arc<dyn ConfigProvider>, sink: Option<Box<dyn RecordSink>>) -> Result<Self> {
        let sink = match sink {
            Some(custom) => Sink::Custom(custom),
            None => Sink::File(FileSink::open(Arc::clone(&config))?),
        };
        let writer = Writer::new(sink, config.multithreaded())?;

        Ok(Self {
            config,
            header: HeaderCache::new(),
            modules: ModuleResolver::system(),
            writer,
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        })
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    pub(crate) fn is_enabled(&self, verbosity: Verbosity) -> bool {
        self.config.verbosity().allows(verbosity)
    }

    fn render_header(&self, record: &LogRecord, bypass_cache: bool) -> String {
        let template = self.config.header_template();
        let location = record.location();
        let module_name = if template.contains("$(module)") || template.contains("$(MODULE)") {
            self.modules.module_name_for(location.caller_address)
        } else {
            String::new()
        };

        let ctx = HeaderContext {
            template: &template,
            global_verbosity: self.config.verbosity(),
            verbosity: record.verbosity(),
            timestamp: record.timestamp(),
            thread_id: record.thread_id(),
            process_id: record.process_id(),
            source_file: location.file,
            line: location.line,
            function: location.function,
            module_name: &module_name,
        };
        if bypass_cache {
            self.header.render_or_bypass(&ctx)
        } else {
            self.header.render(&ctx)
        }
    }

    /// ヘッダと本文から、ファイルに出力する1行を作成する。
    fn format(&self, verbosity: Verbosity, location: &Location, body: String, bypass_cache: bool) -> String {
        let record = LogRecord::new(verbosity, *location, body, self.now());
        let header = self.render_header(&record, bypass_cache);
        record.into_line(&header)
    }

    fn submit(&self, verbosity: Verbosity, location: &Location, body: String) {
        let line = self.format(verbosity, location, body, false);
        self.enqueue(line);
    }

    /// ヘッダが空でない場合だけ、ダンプの前で改行する。
    fn submit_dump(&self, verbosity: Verbosity, location: &Location, dump: &str) {
        let record = LogRecord::new(verbosity, *location, String::new(), self.now());
        let header = self.render_header(&record, false);
        let body = if header.is_empty() {
            dump.to_string()
        } else {
            format!("\n{}", dump)
        };
        self.enqueue(record::compose_line(&header, &body));
    }

    /// 作成済みのレコードをキューに追加する。
    pub(crate) fn enqueue(&self, line: String) {
        if let Err(e) = self.writer.enqueue(line) {
            tracing::debug!(target: TARGET, "record dropped: {}", e);
        }
    }

    fn write_snapshot(&self, report: &str) {
        let path = crash::create_snapshot_filename(&self.config.log_file_name(), &self.now())
            .map(|name| self.config.log_directory().join(name));
        let result = path.and_then(|path| Ok(fs::write(path, format!("{}\n", report))?));
        if let Err(e) = result {
            tracing::warn!(target: TARGET, "failed to write crash snapshot: {}", e);
        }
    }
}

impl CrashSink for Core {
    fn record_fault(&self, fault: &FaultDescription, addresses: &[usize]) {
        let location = Location::new(fault.program_counter, fault.signal_name(), "", 0);

        let modules = module_resolver::format_module_table(&self.modules.loaded_modules());
        let line = self.format(
            Verbosity::FATAL,
            &location,
            format!("Loaded modules:\n{}", modules.trim_end()),
            true,
        );
        self.enqueue(line);

        // シグナルハンドラの中ではデバッグ情報を読まない
        let frames = stacktrace::symbolicate_with_linker(addresses, &self.modules);
        let report = crash::capture_report(fault, &frames);
        self.write_snapshot(&report);
        let line = self.format(Verbosity::FATAL, &location, report, true);
        self.enqueue(line);

        self.writer.crash_flush(self.config.release_on_crash());
    }

    fn record_panic(&self, message: &str, location: Option<(&str, u32)>) {
        let (file, line) = location.unwrap_or(("<unknown>", 0));
        // フックとパニック処理のフレームを読み飛ばす
        let frames = stacktrace::capture(2, &self.modules);
        let body = format!(
            "*** Panic occurred at {} (line {}): {}\nStack trace:\n{}",
            file,
            line,
            message,
            stacktrace::render(&frames)
        );

        let line = self.format(Verbosity::FATAL, &Location::new(0, "panic", "", 0), body, true);
        self.enqueue(line);
        self.writer.flush();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.writer.shutdown();
    }
}

/// インスタンスの所有状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ownership {
    /// 共有しない
    Private,
    /// 共有領域を作成した
    Master { region: usize, published: usize },
    /// 他のインスタンスが作成した共有領域を使用している
    Attached,
}

/// ロガー
pub struct Logger {
    core: Arc<Core>,
    ownership: Ownership,
    _crash: Option<CrashGuard>,
    _panic: Option<PanicGuard>,
}

impl Logger {
    /// `Logger`を作成する。
    ///
    /// 設定の共有方法が`SharingMode::SharedRegion`の場合、共有領域に他のインスタンスが
    /// あればそのインスタンスを使用して、無ければ作成したインスタンスを共有領域に格納する。
    ///
    /// # 引数
    ///
    /// * config: 設定。
    ///
    /// # 戻り値
    ///
    /// `Logger`インスタンス。
    pub fn new<C: ConfigProvider + 'static>(config: C) -> Result<Self> {
        Self::from_provider(Arc::new(config))
    }

    pub fn from_provider(config: Arc<dyn ConfigProvider>) -> Result<Self> {
        Self::build(config, None)
    }

    /// 利用者が実装した出力先に書き込む`Logger`を作成する。
    ///
    /// 共有領域の既存のインスタンスを使用する場合、`sink`は使用しない。
    pub fn with_sink<C: ConfigProvider + 'static>(
        config: C,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self> {
        Self::build(Arc::new(config), Some(sink))
    }

    fn build(config: Arc<dyn ConfigProvider>, sink: Option<Box<dyn RecordSink>>) -> Result<Self> {
        let (core, ownership) = match config.sharing() {
            SharingMode::Private => (Arc::new(Core::open(config, sink)?), Ownership::Private),
            SharingMode::SharedRegion { id } => open_shared(id, config, sink)?,
        };

        let mut logger = Self {
            core,
            ownership,
            _crash: None,
            _panic: None,
        };
        if ownership == Ownership::Attached {
            return Ok(logger);
        }

        let target: Weak<dyn CrashSink> = Arc::downgrade(&logger.core) as Weak<dyn CrashSink>;
        if logger.core.config.crash_capture() {
            logger._crash = Some(crash::install(target.clone())?);
        }
        if logger.core.config.capture_panics() {
            logger._panic = Some(crash::install_panic_hook(target));
        }

        Ok(logger)
    }

    /// `verbosity`のレコードを出力するか確認する。
    pub fn is_enabled(&self, verbosity: Verbosity) -> bool {
        self.core.is_enabled(verbosity)
    }

    /// レコードを出力する。
    ///
    /// 書き込みに失敗しても、エラーは返却しない。
    ///
    /// # 引数
    ///
    /// * verbosity: レコードのレベル。
    /// * location: 呼び出し元の位置。
    /// * args: 本文。
    pub fn log(&self, verbosity: Verbosity, location: &Location, args: fmt::Arguments<'_>) {
        if !self.is_enabled(verbosity) {
            return;
        }
        self.core.submit(verbosity, location, fmt::format(args));
    }

    /// バイト列の16進ダンプを出力する。
    pub fn log_binary(&self, verbosity: Verbosity, location: &Location, data: &[u8]) {
        if !self.is_enabled(verbosity) {
            return;
        }
        let dump = record::hex_dump(data);
        self.core
            .submit_dump(verbosity, location, dump.trim_end_matches('\n'));
    }

    /// 呼び出したスレッドのスタックトレースを出力する。
    pub fn log_stack_trace(&self, verbosity: Verbosity, location: &Location) {
        if !self.is_enabled(verbosity) {
            return;
        }
        let frames = stacktrace::capture(1, &self.core.modules);
        self.core.submit(
            verbosity,
            location,
            format!("Stack trace:\n{}", stacktrace::render(&frames)),
        );
    }

    /// ロード済みモジュールの一覧を出力する。
    pub fn log_modules(&self, verbosity: Verbosity, location: &Location) {
        if !self.is_enabled(verbosity) {
            return;
        }
        let table = module_resolver::format_module_table(&self.core.modules.loaded_modules());
        self.core.submit(
            verbosity,
            location,
            format!("Loaded modules:\n{}", table.trim_end()),
        );
    }

    /// エラーと、その原因をすべて出力する。
    pub fn log_error(&self, verbosity: Verbosity, location: &Location, error: &dyn StdError) {
        if !self.is_enabled(verbosity) {
            return;
        }
        let mut body = format!(
            "*** Error occurred at {} (line {})\n{}",
            location.file, location.line, error
        );
        let mut source = error.source();
        while let Some(cause) = source {
            body.push_str(&format!("\ncaused by: {}", cause));
            source = cause.source();
        }
        self.core.submit(verbosity, location, body);
    }

    /// これまでに出力したレコードが書き込まれるまで待つ。
    pub fn flush(&self) {
        self.core.writer.flush();
    }

    /// 書き込みを終了する。
    ///
    /// 他のインスタンスが作成した共有領域を使用している場合は、フラッシュだけを行う。
    pub fn shutdown(&self) {
        match self.ownership {
            Ownership::Attached => self.core.writer.flush(),
            _ => self.core.writer.shutdown(),
        }
    }

    /// 障害を記録する。
    ///
    /// シグナルハンドラが受け取った障害と同じ処理を、呼び出したスレッドのスタックで行う。
    pub fn report_fault(&self, fault: &FaultDescription) {
        let addresses = stacktrace::capture_addresses(0);
        self.core.record_fault(fault, addresses.as_slice());
    }

    /// `tracing-subscriber`の出力先として使用する`RollingAppender`を返却する。
    pub fn appender(&self) -> RollingAppender {
        RollingAppender::new(Arc::clone(&self.core))
    }

    /// 共有領域を作成したインスタンスか確認する。
    pub fn is_shared_master(&self) -> bool {
        matches!(self.ownership, Ownership::Master { .. })
    }

    /// 他のインスタンスが作成した共有領域を使用しているか確認する。
    pub fn is_attached(&self) -> bool {
        self.ownership == Ownership::Attached
    }

    /// 書き込み中のログファイルのパス
    pub fn log_file_path(&self) -> PathBuf {
        self.core.config.log_file_path()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Ownership::Master { region, published } = self.ownership {
            SingletonLocator::new(ProcessAddressSpace).retract_at(region);
            // SAFETY: `open_shared`で`Arc::into_raw`したポインタを1度だけ戻す。
            unsafe { drop(Arc::from_raw(published as *const Core)) };
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("log_file_path", &self.log_file_path())
            .field("ownership", &self.ownership)
            .finish()
    }
}

/// 共有領域のインスタンスを使用するか、作成したインスタンスを共有領域に格納する。
///
/// 共有領域を作成できない場合は、共有しないインスタンスにする。
fn open_shared(
    id: u8,
    config: Arc<dyn ConfigProvider>,
    sink: Option<Box<dyn RecordSink>>,
) -> Result<(Arc<Core>, Ownership)> {
    let locator = SingletonLocator::new(ProcessAddressSpace);

    if let Some(published) = locator.locate(id).filter(|p| *p != 0) {
        let published = published as *const Core;
        // SAFETY: 共有領域のポインタは、同じ型の`Arc::into_raw`で作成されたもの。
        // 作成したインスタンスは、共有領域を解放するまで参照を保持している。
        let core = unsafe {
            Arc::increment_strong_count(published);
            Arc::from_raw(published)
        };
        tracing::debug!(target: TARGET, id, "attached to shared logger");
        return Ok((core, Ownership::Attached));
    }

    let core = Arc::new(Core::open(config, sink)?);
    let published = Arc::into_raw(Arc::clone(&core)) as usize;
    match locator.publish(id, published) {
        Some(region) => {
            tracing::debug!(target: TARGET, id, region, "published shared logger");
            Ok((core, Ownership::Master { region, published }))
        }
        None => {
            // SAFETY: 直前に`Arc::into_raw`したポインタ。
            unsafe { drop(Arc::from_raw(published as *const Core)) };
            tracing::debug!(target: TARGET, id, "no free shared region, using a private logger");
            Ok((core, Ownership::Private))
        }
    }
}
