//! レコードの出力先
//!
//! 出力先はロガーの作成時に一度だけ決定する。ローテーションするのはファイルだけである。

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{ConfigProvider, WriteMode};
use crate::error::{Error, Result};
use crate::rotation::RotationManager;

/// 利用者が実装する出力先
pub trait RecordSink: Send {
    /// 改行で終わるレコードを1件書き込む。
    fn write_record(&mut self, record: &str) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 書き込みスレッドが所有する出力先
pub enum Sink {
    File(FileSink),
    Custom(Box<dyn RecordSink>),
}

impl Sink {
    pub fn write(&mut self, record: &str) -> Result<()> {
        match self {
            Sink::File(file) => file.write(record),
            Sink::Custom(sink) => Ok(sink.write_record(record)?),
        }
    }

    /// ローテーションを確認しないで書き込む。
    ///
    /// 書き込みの失敗を同じ出力先に報告するために使用する。
    pub fn write_diagnostic(&mut self, line: &str) -> Result<()> {
        match self {
            Sink::File(file) => file.append(line),
            Sink::Custom(sink) => Ok(sink.write_record(line)?),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Sink::File(file) => file.flush(),
            Sink::Custom(sink) => Ok(sink.flush()?),
        }
    }

    /// フラッシュして、ファイルを閉じる。
    pub fn close(&mut self) -> Result<()> {
        match self {
            Sink::File(file) => file.close(),
            Sink::Custom(sink) => Ok(sink.flush()?),
        }
    }

    /// 書き込み中のログファイルのパス
    pub fn live_path(&self) -> Option<PathBuf> {
        match self {
            Sink::File(file) => Some(file.live_path()),
            Sink::Custom(_) => None,
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::File(file) => f.debug_tuple("File").field(&file.live_path()).finish(),
            Sink::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// サイズでローテーションするログファイル
pub struct FileSink {
    config: Arc<dyn ConfigProvider>,
    rotation: RotationManager,
    handle: Option<BufWriter<File>>,
    /// 前回のローテーション以降に書き込んだバイト数
    size: u64,
}

impl FileSink {
    /// ログファイルを開く。
    ///
    /// ディレクトリが存在しない場合は作成する。起動時のローテーションが設定されている場合は、
    /// ファイルを開く前にローテーションする。
    ///
    /// # 引数
    ///
    /// * config: 設定。
    ///
    /// # 戻り値
    ///
    /// `FileSink`インスタンス。
    pub fn open(config: Arc<dyn ConfigProvider>) -> Result<Self> {
        let rotation = RotationManager::new(config.log_directory(), config.log_file_name())?;
        create_directory(rotation.directory())?;

        if config.rotate_on_start() {
            rotation.rotate(config.rotation_count())?;
        }

        let mut sink = Self {
            config,
            rotation,
            handle: None,
            size: 0,
        };
        sink.reopen()?;

        Ok(sink)
    }

    pub fn live_path(&self) -> PathBuf {
        self.rotation.live_path()
    }

    /// 前回のローテーション以降に書き込んだバイト数
    pub fn size(&self) -> u64 {
        self.size
    }

    /// レコードを書き込む。
    ///
    /// 書き込むとサイズの上限を超える場合は、書き込む前にローテーションする。
    /// ローテーションに失敗した場合も、レコードは現在のファイルに書き込む。
    pub fn write(&mut self, record: &str) -> Result<()> {
        self.follow_config()?;

        let prospective = self.size + record.len() as u64;
        let rotated = if self.size > 0 {
            self.rotate_if_needed(prospective)
        } else {
            Ok(())
        };

        self.append(record)?;
        rotated
    }

    fn rotate_if_needed(&mut self, prospective: u64) -> Result<()> {
        let threshold = self.config.rotation_size();
        if !RotationManager::needs_rotation(prospective, threshold, false) {
            return Ok(());
        }

        self.close()?;
        let rotated = self
            .rotation
            .maybe_rotate(prospective, threshold, self.config.rotation_count(), false);
        self.reopen()?;

        if let Some(outcome) = rotated? {
            tracing::debug!(
                target: "restricted_rolling_logger",
                deleted = ?outcome.deleted,
                renamed = ?outcome.renamed,
                "rotated {}",
                self.rotation.live_path().display()
            );
        }
        Ok(())
    }

    /// ローテーションを確認しないで、ファイルの末尾に追加する。
    pub fn append(&mut self, record: &str) -> Result<()> {
        match self.config.write_mode() {
            WriteMode::Persistent => {
                if self.handle.is_none() {
                    self.handle = Some(BufWriter::new(open_append(&self.rotation.live_path())?));
                }
                if let Some(handle) = self.handle.as_mut() {
                    handle.write_all(record.as_bytes())?;
                }
            }
            WriteMode::ReopenPerWrite => {
                if let Some(mut handle) = self.handle.take() {
                    handle.flush()?;
                }
                let mut file = open_append(&self.rotation.live_path())?;
                file.write_all(record.as_bytes())?;
            }
        }
        self.size += record.len() as u64;

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            handle.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.flush()?;
            handle.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// 書き込み中のファイルを開き直し、サイズをファイルの長さに合わせる。
    fn reopen(&mut self) -> Result<()> {
        let path = self.rotation.live_path();
        self.size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if self.config.write_mode() == WriteMode::Persistent {
            self.handle = Some(BufWriter::new(open_append(&path)?));
        }
        Ok(())
    }

    /// ログファイルの場所が変更された場合は、新しい場所のファイルに切り替える。
    fn follow_config(&mut self) -> Result<()> {
        let directory = self.config.log_directory();
        let file_name = self.config.log_file_name();
        if directory == self.rotation.directory() && file_name == self.rotation.file_name() {
            return Ok(());
        }

        self.close()?;
        self.rotation = RotationManager::new(&directory, file_name)?;
        create_directory(&directory)?;
        self.reopen()
    }
}

fn create_directory(directory: &Path) -> Result<()> {
    fs::create_dir_all(directory).map_err(|source| Error::CreateDirectory {
        path: directory.to_path_buf(),
        source,
    })
}

/// 追記モードでファイルを開く。
///
/// ファイルを開けない場合は、親ディレクトリを作成してから開き直す。
///
/// # 引数
///
/// * path: ログファイルパス。
///
/// # 戻り値
///
/// `File`インスタンス。
pub fn open_append(path: &Path) -> Result<File> {
    let mut open_options = OpenOptions::new();
    open_options.append(true).create(true);

    let open_error = |source: io::Error| Error::OpenFile {
        path: path.to_path_buf(),
        source,
    };
    match open_options.open(path) {
        Ok(file) => Ok(file),
        Err(e) => match path.parent() {
            Some(parent) => {
                create_directory(parent)?;
                open_options.open(path).map_err(open_error)
            }
            None => Err(open_error(e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{LogConfig, SharedConfig};

    fn file_sink(config: LogConfig) -> FileSink {
        FileSink::open(Arc::new(config)).unwrap()
    }

    #[test]
    fn test_open_append_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("foo.log");

        let mut file = open_append(&path).unwrap();
        file.write_all(b"hello\n").unwrap();

        assert_eq!("hello\n", fs::read_to_string(path).unwrap());
    }

    #[test]
    fn test_size_starts_at_file_length() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("foo.log"), "0123456789").unwrap();

        let sink = file_sink(LogConfig::new(dir.path(), "foo.log"));

        assert_eq!(10, sink.size());
    }

    #[test]
    fn test_rotation_before_overflowing_write() {
        let dir = TempDir::new().unwrap();
        let mut sink = file_sink(LogConfig::new(dir.path(), "foo.log").with_rotation(10, 3));

        sink.write("123456789").unwrap();
        sink.write("ab").unwrap();
        sink.flush().unwrap();

        assert_eq!("123456789", fs::read_to_string(dir.path().join("foo.log.1")).unwrap());
        assert_eq!("ab", fs::read_to_string(dir.path().join("foo.log")).unwrap());
        assert_eq!(2, sink.size());
        assert!(!dir.path().join("foo.log.2").exists());
    }

    #[test]
    fn test_oversized_record_in_empty_file_is_not_rotated() {
        let dir = TempDir::new().unwrap();
        let mut sink = file_sink(LogConfig::new(dir.path(), "foo.log").with_rotation(4, 3));

        sink.write("0123456789").unwrap();
        sink.flush().unwrap();

        assert!(!dir.path().join("foo.log.1").exists());
        assert_eq!(10, sink.size());
    }

    #[test]
    fn test_rotate_on_start() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("foo.log"), "previous run\n").unwrap();

        let sink = file_sink(LogConfig::new(dir.path(), "foo.log").with_rotate_on_start(true));

        assert_eq!(0, sink.size());
        assert_eq!(
            "previous run\n",
            fs::read_to_string(dir.path().join("foo.log.1")).unwrap()
        );
    }

    #[test]
    fn test_reopen_per_write() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::new(dir.path(), "foo.log").with_write_mode(WriteMode::ReopenPerWrite);
        let mut sink = file_sink(config);

        sink.write("one\n").unwrap();

        // フラッシュしなくてもファイルに書き込まれている
        assert_eq!("one\n", fs::read_to_string(dir.path().join("foo.log")).unwrap());
    }

    #[test]
    fn test_follows_changed_file_name() {
        let dir = TempDir::new().unwrap();
        let shared = SharedConfig::new(LogConfig::new(dir.path(), "foo.log"));
        let mut sink = FileSink::open(Arc::new(shared.clone())).unwrap();

        sink.write("foo\n").unwrap();
        shared.update(|c| c.log_file_name = "bar.log".to_string());
        sink.write("bar\n").unwrap();
        sink.flush().unwrap();

        assert_eq!("foo\n", fs::read_to_string(dir.path().join("foo.log")).unwrap());
        assert_eq!("bar\n", fs::read_to_string(dir.path().join("bar.log")).unwrap());
    }

    struct VecSink(Arc<parking_lot::Mutex<Vec<String>>>);

    impl RecordSink for VecSink {
        fn write_record(&mut self, record: &str) -> io::Result<()> {
            self.0.lock().push(record.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_custom_sink() {
        let records = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut sink = Sink::Custom(Box::new(VecSink(Arc::clone(&records))));

        sink.write("one\n").unwrap();
        sink.write_diagnostic("two\n").unwrap();

        assert_eq!(vec!["one\n", "two\n"], *records.lock());
        assert_eq!(None, sink.live_path());
    }
}
