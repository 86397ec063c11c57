//! 書き込みスレッド
//!
//! 書き込みスレッドだけが出力先（ファイルハンドルとローテーションのカウンタ）を所有する。
//! 呼び出し元のスレッドはキューにレコードを追加して、条件変数で書き込みスレッドを起こすだけで、
//! ファイルI/Oを待たない。
//!
//! 書き込みスレッドは起きるたびにキューのレコードをすべて取り出し、キューのロックを解放してから
//! 1件ずつ書き込む。ローテーションはレコードごとに確認する。
//!
//! クラッシュ時だけは、呼び出し元のスレッドが出力先に直接書き込む。

use std::collections::VecDeque;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::sink::{self, Sink};

/// 書き込みスレッドがキューを確認する間隔
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// 書き込みスレッドの終了を待つ時間
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// `flush`で待つ時間
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// クラッシュ時にロックの獲得を待つ時間
const CRASH_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_THREAD_NAME: &str = "restricted-rolling-logger";

/// 書き込みの失敗を報告する。
///
/// `tracing`に出力して、同じ出力先にも1行書き込む。その書き込みも失敗した場合は破棄する。
fn report_failure(sink: &mut Sink, what: &str, error: &Error) {
    tracing::warn!(target: "restricted_rolling_logger", "{} failed: {}", what, error);
    let _ = sink.write_diagnostic(&format!("*** logger: {} failed: {}\n", what, error));
}

fn write_batch(sink: &mut Sink, records: impl IntoIterator<Item = String>) {
    for record in records {
        if let Err(e) = sink.write(&record) {
            report_failure(sink, "write", &e);
        }
    }
    if let Err(e) = sink.flush() {
        report_failure(sink, "flush", &e);
    }
}

/// 出力先にレコードを書き込む方法
pub enum Writer {
    /// 書き込みスレッドで書き込む
    Background(AsyncWriter),
    /// 呼び出し元のスレッドで書き込む
    Direct(DirectWriter),
}

impl Writer {
    /// 設定に合わせて`Writer`を作成する。
    ///
    /// # 引数
    ///
    /// * sink: 出力先。
    /// * multithreaded: 書き込みスレッドを使う場合は`true`。
    ///
    /// # 戻り値
    ///
    /// `Writer`インスタンス。
    pub fn new(sink: Sink, multithreaded: bool) -> Result<Self> {
        if multithreaded {
            AsyncWriter::spawn(sink).map(Writer::Background)
        } else {
            Ok(Writer::Direct(DirectWriter::new(sink)))
        }
    }

    /// レコードを書き込む（またはキューに追加する）。
    pub fn enqueue(&self, record: String) -> Result<()> {
        match self {
            Writer::Background(writer) => writer.enqueue(record),
            Writer::Direct(writer) => writer.write(record),
        }
    }

    /// これまでに追加したレコードが書き込まれるまで待つ。
    pub fn flush(&self) {
        match self {
            Writer::Background(writer) => writer.flush(),
            Writer::Direct(writer) => writer.flush(),
        }
    }

    /// 書き込みを終了して、出力先を閉じる。
    pub fn shutdown(&self) {
        match self {
            Writer::Background(writer) => writer.shutdown(),
            Writer::Direct(writer) => writer.shutdown(),
        }
    }

    /// クラッシュ時に、キューのレコードを呼び出し元のスレッドで書き込む。
    ///
    /// # 引数
    ///
    /// * release: 書き込んだ後で出力先を閉じる場合は`true`。
    pub fn crash_flush(&self, release: bool) {
        match self {
            Writer::Background(writer) => writer.crash_flush(release),
            Writer::Direct(writer) => writer.crash_flush(release),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Writer::Background(writer) => writer.is_closed(),
            Writer::Direct(writer) => writer.is_closed(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    /// キューに追加したレコード数
    enqueued: u64,
    /// 書き込んだレコード数
    written: u64,
    /// 終了を要求された
    terminating: bool,
    /// 出力先を閉じた
    finished: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    /// レコードの追加と終了要求を書き込みスレッドに通知する
    wake: Condvar,
    /// 書き込みの進捗を`flush`と`shutdown`に通知する
    progress: Condvar,
    sink: Mutex<Sink>,
    /// 起動時のログファイルのパス
    live_path: Option<PathBuf>,
}

/// 書き込みスレッドを持つ`Writer`
pub struct AsyncWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncWriter {
    /// 書き込みスレッドを起動する。
    pub fn spawn(sink: Sink) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            progress: Condvar::new(),
            live_path: sink.live_path(),
            sink: Mutex::new(sink),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || run_worker(&worker_shared))
            .map_err(Error::Spawn)?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn enqueue(&self, record: String) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.terminating {
            return Err(Error::WriterClosed);
        }
        queue.pending.push_back(record);
        queue.enqueued += 1;
        drop(queue);

        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn flush(&self) {
        let deadline = Instant::now() + FLUSH_TIMEOUT;
        let mut queue = self.shared.queue.lock();
        let target = queue.enqueued;
        self.shared.wake.notify_one();

        while queue.written < target && !queue.finished {
            if self
                .shared
                .progress
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                tracing::warn!(
                    target: "restricted_rolling_logger",
                    pending = target - queue.written,
                    "flush timed out"
                );
                return;
            }
        }
    }

    pub fn shutdown(&self) {
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let mut queue = self.shared.queue.lock();
        queue.terminating = true;
        self.shared.wake.notify_one();

        while !queue.finished {
            if self
                .shared
                .progress
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                tracing::warn!(
                    target: "restricted_rolling_logger",
                    "writer thread did not finish in {:?}",
                    SHUTDOWN_TIMEOUT
                );
                return;
            }
        }
        drop(queue);

        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::warn!(target: "restricted_rolling_logger", "writer thread panicked");
            }
        }
    }

    pub fn crash_flush(&self, release: bool) {
        let records = match self.shared.queue.try_lock_for(CRASH_LOCK_TIMEOUT) {
            Some(mut queue) => {
                if release {
                    queue.terminating = true;
                }
                mem::take(&mut queue.pending)
            }
            None => VecDeque::new(),
        };
        let count = records.len() as u64;

        match self.shared.sink.try_lock_for(CRASH_LOCK_TIMEOUT) {
            Some(mut sink) => {
                write_batch(&mut sink, records);
                if release {
                    let _ = sink.close();
                }
            }
            None => {
                if let Some(path) = &self.shared.live_path {
                    emergency_append(path, records);
                }
            }
        }

        if let Some(mut queue) = self.shared.queue.try_lock_for(CRASH_LOCK_TIMEOUT) {
            queue.written += count;
            if release {
                queue.finished = true;
            }
            drop(queue);
            self.shared.progress.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().terminating
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        {
            let mut queue = shared.queue.lock();
            while queue.pending.is_empty() && !queue.terminating {
                shared.wake.wait_for(&mut queue, IDLE_TIMEOUT);
            }
            if queue.finished {
                return;
            }
        }

        // キューから取り出したレコードは、出力先のロックを保持したまま書き込む
        let mut sink = shared.sink.lock();
        let (batch, terminating) = {
            let mut queue = shared.queue.lock();
            (mem::take(&mut queue.pending), queue.terminating)
        };
        let count = batch.len() as u64;
        if count > 0 {
            write_batch(&mut sink, batch);
        }
        // 終了要求の後はレコードを受け付けないため、キューは空
        if terminating {
            if let Err(e) = sink.close() {
                tracing::warn!(target: "restricted_rolling_logger", "close failed: {}", e);
            }
        }
        drop(sink);

        let mut queue = shared.queue.lock();
        queue.written += count;
        if terminating {
            queue.finished = true;
        }
        drop(queue);
        shared.progress.notify_all();

        if terminating {
            return;
        }
    }
}

/// 出力先のロックを獲得できない場合に、ログファイルへ直接追記する。
fn emergency_append(path: &Path, records: impl IntoIterator<Item = String>) {
    use std::io::Write;

    if let Ok(mut file) = sink::open_append(path) {
        for record in records {
            let _ = file.write_all(record.as_bytes());
        }
        let _ = file.sync_data();
    }
}

/// 呼び出し元のスレッドで書き込む`Writer`
pub struct DirectWriter {
    sink: Mutex<Sink>,
    closed: AtomicBool,
}

impl DirectWriter {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub fn write(&self, record: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::WriterClosed);
        }
        let mut sink = self.sink.lock();
        if let Err(e) = sink.write(&record) {
            report_failure(&mut sink, "write", &e);
        }
        Ok(())
    }

    pub fn flush(&self) {
        let mut sink = self.sink.lock();
        if let Err(e) = sink.flush() {
            report_failure(&mut sink, "flush", &e);
        }
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sink.lock().close() {
            tracing::warn!(target: "restricted_rolling_logger", "close failed: {}", e);
        }
    }

    pub fn crash_flush(&self, release: bool) {
        if let Some(mut sink) = self.sink.try_lock_for(CRASH_LOCK_TIMEOUT) {
            let _ = sink.flush();
            if release {
                let _ = sink.close();
            }
        }
        if release {
            self.closed.store(true, Ordering::Release);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::config::LogConfig;
    use crate::sink::{FileSink, RecordSink};

    fn file_writer(config: LogConfig, multithreaded: bool) -> Writer {
        let sink = FileSink::open(Arc::new(config)).unwrap();
        Writer::new(Sink::File(sink), multithreaded).unwrap()
    }

    #[test]
    fn test_concurrent_records_are_written_in_enqueue_order() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::new(dir.path(), "foo.log").with_rotation(0, 0);
        let writer = Arc::new(file_writer(config, true));
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    for i in 0..200 {
                        let record = format!("thread {} record {}\n", t, i);
                        // 追加した順序を記録するため、追加とログを同じロックで保護する
                        let mut order = order.lock();
                        writer.enqueue(record.clone()).unwrap();
                        order.push(record);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.shutdown();

        let expected: String = order.lock().concat();
        assert_eq!(expected, fs::read_to_string(dir.path().join("foo.log")).unwrap());
    }

    #[test]
    fn test_flush_waits_for_records() {
        let dir = TempDir::new().unwrap();
        let writer = file_writer(LogConfig::new(dir.path(), "foo.log"), true);

        writer.enqueue("one\n".to_string()).unwrap();
        writer.enqueue("two\n".to_string()).unwrap();
        writer.flush();

        assert_eq!(
            "one\ntwo\n",
            fs::read_to_string(dir.path().join("foo.log")).unwrap()
        );
    }

    #[test]
    fn test_enqueue_after_shutdown_is_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = file_writer(LogConfig::new(dir.path(), "foo.log"), true);

        writer.shutdown();
        writer.shutdown();

        assert!(writer.is_closed());
        assert!(matches!(
            writer.enqueue("late\n".to_string()),
            Err(Error::WriterClosed)
        ));
    }

    #[test]
    fn test_rotation_inside_one_burst() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::new(dir.path(), "foo.log").with_rotation(10, 5);
        let writer = file_writer(config, true);

        for record in ["aaaa\n", "bbbb\n", "cccc\n"] {
            writer.enqueue(record.to_string()).unwrap();
        }
        writer.shutdown();

        assert_eq!(
            "aaaa\nbbbb\n",
            fs::read_to_string(dir.path().join("foo.log.1")).unwrap()
        );
        assert_eq!("cccc\n", fs::read_to_string(dir.path().join("foo.log")).unwrap());
    }

    #[test]
    fn test_direct_writer() {
        let dir = TempDir::new().unwrap();
        let writer = file_writer(LogConfig::new(dir.path(), "foo.log"), false);

        writer.enqueue("one\n".to_string()).unwrap();
        writer.flush();

        assert_eq!("one\n", fs::read_to_string(dir.path().join("foo.log")).unwrap());
    }

    #[test]
    fn test_crash_flush_writes_pending_records_and_releases() {
        let dir = TempDir::new().unwrap();
        let writer = file_writer(LogConfig::new(dir.path(), "foo.log"), true);

        writer.enqueue("before crash\n".to_string()).unwrap();
        writer.crash_flush(true);

        assert_eq!(
            "before crash\n",
            fs::read_to_string(dir.path().join("foo.log")).unwrap()
        );
        assert!(writer.is_closed());
    }

    struct FailingSink {
        diagnostics: Arc<Mutex<Vec<String>>>,
    }

    impl RecordSink for FailingSink {
        fn write_record(&mut self, record: &str) -> io::Result<()> {
            if record.starts_with("*** logger:") {
                self.diagnostics.lock().push(record.to_string());
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
        }
    }

    #[test]
    fn test_write_failure_is_reported_to_same_sink() {
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let sink = Sink::Custom(Box::new(FailingSink {
            diagnostics: Arc::clone(&diagnostics),
        }));
        let writer = Writer::new(sink, true).unwrap();

        writer.enqueue("lost\n".to_string()).unwrap();
        writer.flush();

        let diagnostics = diagnostics.lock();
        assert_eq!(1, diagnostics.len());
        assert!(diagnostics[0].contains("write failed"));
        assert!(diagnostics[0].contains("disk full"));
    }
}
