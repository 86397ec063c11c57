//! エラー型
//!
//! ロガー内部の操作（ディレクトリ作成、ローテーション、ファイルのオープン、
//! スレッドの起動、シグナルハンドラの登録、固定アドレスへのマッピング）は、
//! このモジュールの`Result`を返す。
//! ログを出力する公開関数は、エラーを呼び出し元に返さない。

use std::io;
use std::path::PathBuf;

/// ロガーの`Result`型
pub type Result<T> = std::result::Result<T, Error>;

/// ロガー内部で発生するエラー
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/Oエラー
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// ログディレクトリの作成に失敗
    #[error("failed to create log directory at {}: {source}", .path.display())]
    CreateDirectory {
        /// 作成しようとしたディレクトリ
        path: PathBuf,
        /// 原因
        source: io::Error,
    },

    /// ログファイルのオープンに失敗
    #[error("failed to open log file {}: {source}", .path.display())]
    OpenFile {
        /// ログファイルパス
        path: PathBuf,
        /// 原因
        source: io::Error,
    },

    /// ローテーション中のファイル操作に失敗
    #[error("failed to rotate {} to {}: {source}", .from.display(), .to.display())]
    Rotation {
        /// 移動元
        from: PathBuf,
        /// 移動先（削除の場合は移動元と同じ）
        to: PathBuf,
        /// 原因
        source: io::Error,
    },

    /// ローテーション対象のファイル名からパターンを作成できない
    #[error("invalid rotation pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// 書き込みスレッドの起動に失敗
    #[error("failed to spawn writer thread: {0}")]
    Spawn(io::Error),

    /// 書き込みスレッドは既に終了している
    #[error("writer is shut down")]
    WriterClosed,

    /// シグナルハンドラの登録に失敗
    #[error("failed to install handler for signal {signal}: {source}")]
    HandlerInstall {
        /// シグナル番号
        signal: i32,
        /// 原因
        source: io::Error,
    },

    /// 日時の書式化に失敗
    #[error("failed to format timestamp: {0}")]
    TimeFormat(String),

    /// 指定したアドレスにページをマップできない
    #[error("region at {address:#x} is unavailable")]
    RegionUnavailable {
        /// 要求したアドレス
        address: usize,
    },
}
