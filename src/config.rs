//! 設定
//!
//! ロガーは設定を読み取るだけで、設定ファイルやレジストリを解析しない。
//! 設定は`ConfigProvider`を通じて、操作のたびに読み直される。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::verbosity::Verbosity;

/// ヘッダの既定の書式
pub const DEFAULT_HEADER_TEMPLATE: &str =
    "[$(V)] $(dd).$(MM).$(yyyy) $(hh):$(mm):$(ss).$(ttt) [$(PID):$(TID)] [$(module)!$(function)]";

/// ローテーションする既定のファイルサイズ（バイト）
pub const DEFAULT_ROTATION_SIZE: u64 = 2_097_152;

/// 残す既定のファイル数
pub const DEFAULT_ROTATION_COUNT: usize = 15;

/// ファイルへの書き込み方法
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// ファイルを開いたままにする
    #[default]
    Persistent,
    /// レコードごとにファイルを開いて閉じる
    ReopenPerWrite,
}

/// ロガーインスタンスの共有方法
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SharingMode {
    /// 共有しない
    #[default]
    Private,
    /// 固定アドレスの共有領域を通じて、インスタンスを共有する
    SharedRegion {
        /// 共有領域の識別子
        id: u8,
    },
}

/// ロガーが読み取る設定
pub trait ConfigProvider: Send + Sync {
    fn log_directory(&self) -> PathBuf;
    fn log_file_name(&self) -> String;
    fn header_template(&self) -> String;
    fn verbosity(&self) -> Verbosity;
    /// 0の場合、サイズによるローテーションをしない。
    fn rotation_size(&self) -> u64;
    /// 0の場合、ファイルを削除しない。
    fn rotation_count(&self) -> usize;
    fn rotate_on_start(&self) -> bool;
    fn multithreaded(&self) -> bool;
    fn write_mode(&self) -> WriteMode;
    fn sharing(&self) -> SharingMode;
    fn crash_capture(&self) -> bool;
    fn capture_panics(&self) -> bool;
    fn release_on_crash(&self) -> bool;

    fn log_file_path(&self) -> PathBuf {
        self.log_directory().join(self.log_file_name())
    }
}

/// 設定値
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    pub log_directory: PathBuf,
    pub log_file_name: String,
    pub header_template: String,
    pub verbosity: Verbosity,
    pub rotation_size: u64,
    pub rotation_count: usize,
    pub rotate_on_start: bool,
    pub multithreaded: bool,
    pub write_mode: WriteMode,
    pub sharing: SharingMode,
    pub crash_capture: bool,
    pub capture_panics: bool,
    pub release_on_crash: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        let (log_directory, log_file_name) = process_log_location();

        Self {
            log_directory,
            log_file_name,
            header_template: DEFAULT_HEADER_TEMPLATE.to_string(),
            verbosity: Verbosity::OPTIMAL,
            rotation_size: DEFAULT_ROTATION_SIZE,
            rotation_count: DEFAULT_ROTATION_COUNT,
            rotate_on_start: false,
            multithreaded: true,
            write_mode: WriteMode::Persistent,
            sharing: SharingMode::Private,
            crash_capture: false,
            capture_panics: false,
            release_on_crash: true,
        }
    }
}

impl LogConfig {
    /// ディレクトリとファイル名を指定して、`LogConfig`を作成する。
    ///
    /// # 引数
    ///
    /// * directory: ログファイルを作成するディレクトリ。
    /// * file_name: ログファイル名。ローテーションしたファイルは`{file_name}.{N}`になる。
    ///
    /// # 戻り値
    ///
    /// その他の項目が既定値の`LogConfig`インスタンス。
    pub fn new(directory: impl AsRef<Path>, file_name: impl Into<String>) -> Self {
        Self {
            log_directory: directory.as_ref().to_path_buf(),
            log_file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn with_header_template(mut self, template: impl Into<String>) -> Self {
        self.header_template = template.into();
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_rotation(mut self, size: u64, count: usize) -> Self {
        self.rotation_size = size;
        self.rotation_count = count;
        self
    }

    pub fn with_rotate_on_start(mut self, rotate: bool) -> Self {
        self.rotate_on_start = rotate;
        self
    }

    pub fn with_multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_sharing(mut self, sharing: SharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn with_crash_capture(mut self, enabled: bool) -> Self {
        self.crash_capture = enabled;
        self
    }

    pub fn with_capture_panics(mut self, enabled: bool) -> Self {
        self.capture_panics = enabled;
        self
    }

    pub fn with_release_on_crash(mut self, enabled: bool) -> Self {
        self.release_on_crash = enabled;
        self
    }
}

impl ConfigProvider for LogConfig {
    fn log_directory(&self) -> PathBuf {
        self.log_directory.clone()
    }

    fn log_file_name(&self) -> String {
        self.log_file_name.clone()
    }

    fn header_template(&self) -> String {
        self.header_template.clone()
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    fn rotation_size(&self) -> u64 {
        self.rotation_size
    }

    fn rotation_count(&self) -> usize {
        self.rotation_count
    }

    fn rotate_on_start(&self) -> bool {
        self.rotate_on_start
    }

    fn multithreaded(&self) -> bool {
        self.multithreaded
    }

    fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    fn sharing(&self) -> SharingMode {
        self.sharing
    }

    fn crash_capture(&self) -> bool {
        self.crash_capture
    }

    fn capture_panics(&self) -> bool {
        self.capture_panics
    }

    fn release_on_crash(&self) -> bool {
        self.release_on_crash
    }
}

/// 実行中に変更できる設定
///
/// 複製したインスタンスは同じ設定を参照する。
#[derive(Clone, Debug, Default)]
pub struct SharedConfig(Arc<RwLock<LogConfig>>);

impl SharedConfig {
    pub fn new(config: LogConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// 設定を変更する。
    ///
    /// # 引数
    ///
    /// * f: 設定を変更するクロージャ。書き込みロックを獲得した状態で呼び出される。
    pub fn update(&self, f: impl FnOnce(&mut LogConfig)) {
        f(&mut self.0.write());
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.update(|c| c.verbosity = verbosity);
    }

    pub fn set_header_template(&self, template: impl Into<String>) {
        let template = template.into();
        self.update(|c| c.header_template = template);
    }
}

impl ConfigProvider for SharedConfig {
    fn log_directory(&self) -> PathBuf {
        self.0.read().log_directory.clone()
    }

    fn log_file_name(&self) -> String {
        self.0.read().log_file_name.clone()
    }

    fn header_template(&self) -> String {
        self.0.read().header_template.clone()
    }

    fn verbosity(&self) -> Verbosity {
        self.0.read().verbosity
    }

    fn rotation_size(&self) -> u64 {
        self.0.read().rotation_size
    }

    fn rotation_count(&self) -> usize {
        self.0.read().rotation_count
    }

    fn rotate_on_start(&self) -> bool {
        self.0.read().rotate_on_start
    }

    fn multithreaded(&self) -> bool {
        self.0.read().multithreaded
    }

    fn write_mode(&self) -> WriteMode {
        self.0.read().write_mode
    }

    fn sharing(&self) -> SharingMode {
        self.0.read().sharing
    }

    fn crash_capture(&self) -> bool {
        self.0.read().crash_capture
    }

    fn capture_panics(&self) -> bool {
        self.0.read().capture_panics
    }

    fn release_on_crash(&self) -> bool {
        self.0.read().release_on_crash
    }
}

/// 実行ファイルのディレクトリと、`{実行ファイル名}.log`を返却する。
fn process_log_location() -> (PathBuf, String) {
    let exe = std::env::current_exe().ok();
    let directory = exe
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = exe
        .as_ref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .unwrap_or("process");

    (directory, format!("{}.log", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let config = LogConfig::new("/var/log/foo", "foo.log");

        assert_eq!(PathBuf::from("/var/log/foo/foo.log"), config.log_file_path());
        assert_eq!(DEFAULT_ROTATION_SIZE, config.rotation_size());
        assert_eq!(SharingMode::Private, config.sharing());
    }

    #[test]
    fn test_shared_config_update_is_visible() {
        let shared = SharedConfig::new(LogConfig::new("/tmp", "foo.log"));
        let reader = shared.clone();

        shared.set_verbosity(Verbosity::FATAL_ERROR);
        shared.set_header_template("$(V)");

        assert_eq!(Verbosity::FATAL_ERROR, reader.verbosity());
        assert_eq!("$(V)", reader.header_template());
    }
}
