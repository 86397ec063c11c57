//! ログファイルのローテーション
//!
//! ログファイルが`{file_name}`のとき、ローテーションしたファイルは`{file_name}.1`
//! （最も新しい）、`{file_name}.2`、...となる。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, Result};

/// ローテーションの結果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RotationOutcome {
    /// 削除したファイルのインデックス
    pub deleted: Vec<u32>,
    /// 名前を変更したファイルのインデックス（変更前）
    pub renamed: Vec<u32>,
}

/// ローテーションを管理する。
#[derive(Clone, Debug)]
pub struct RotationManager {
    directory: PathBuf,
    file_name: String,
    pattern: Regex,
}

impl RotationManager {
    /// `RotationManager`を作成する。
    ///
    /// # 引数
    ///
    /// * directory: ログファイルを格納するディレクトリ。
    /// * file_name: ログファイル名。
    ///
    /// # 戻り値
    ///
    /// `RotationManager`インスタンス。
    pub fn new(directory: impl AsRef<Path>, file_name: impl Into<String>) -> Result<Self> {
        let file_name = file_name.into();
        let pattern = Regex::new(&format!(r"^{}\.(\d+)$", regex::escape(&file_name)))?;

        Ok(Self {
            directory: directory.as_ref().to_path_buf(),
            file_name,
            pattern,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// 書き込み中のログファイルのパス
    pub fn live_path(&self) -> PathBuf {
        create_log_filepath(&self.directory, &self.file_name)
    }

    /// `index`番目にローテーションしたファイルのパス
    pub fn rotated_path(&self, index: u32) -> PathBuf {
        self.directory.join(format!("{}.{}", self.file_name, index))
    }

    /// ローテーションが必要か確認する。
    ///
    /// # 引数
    ///
    /// * current_size: ログファイルのサイズ。
    /// * threshold: ローテーションするサイズ。0の場合はサイズで判定しない。
    /// * force: 強制的にローテーションする場合は`true`。
    pub fn needs_rotation(current_size: u64, threshold: u64, force: bool) -> bool {
        force || (threshold > 0 && current_size > threshold)
    }

    /// ディレクトリにあるローテーション済みファイルのインデックスを昇順で返却する。
    ///
    /// インデックス0は書き込み中のファイルを表すため含めない。
    pub fn existing_indices(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(index) = self
                .pattern
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            {
                if index > 0 {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();

        Ok(indices)
    }

    /// 必要な場合だけローテーションする。
    ///
    /// # 引数
    ///
    /// * current_size: ログファイルのサイズ。
    /// * threshold: ローテーションするサイズ。0の場合はサイズで判定しない。
    /// * max_files: 残すファイル数。0の場合はファイルを削除しない。
    /// * force: 強制的にローテーションする場合は`true`。
    ///
    /// # 戻り値
    ///
    /// ローテーションした場合は`Some`。
    pub fn maybe_rotate(
        &self,
        current_size: u64,
        threshold: u64,
        max_files: usize,
        force: bool,
    ) -> Result<Option<RotationOutcome>> {
        if !Self::needs_rotation(current_size, threshold, force) {
            return Ok(None);
        }

        self.rotate(max_files).map(Some)
    }

    /// ローテーションする。
    ///
    /// 最大のインデックスから1まで、存在するファイルだけを`.{i + 1}`に名前を変更するか、
    /// 残すファイル数を超える場合は削除する。その後、書き込み中のファイルを`.1`に名前を変更する。
    pub fn rotate(&self, max_files: usize) -> Result<RotationOutcome> {
        let mut outcome = RotationOutcome::default();

        for index in self.existing_indices()?.into_iter().rev() {
            let from = self.rotated_path(index);
            if max_files > 0 && index as usize + 1 > max_files {
                fs::remove_file(&from).map_err(|source| Error::Rotation {
                    from: from.clone(),
                    to: from.clone(),
                    source,
                })?;
                outcome.deleted.push(index);
            } else {
                let to = self.rotated_path(index + 1);
                fs::rename(&from, &to).map_err(|source| Error::Rotation { from, to, source })?;
                outcome.renamed.push(index);
            }
        }

        let live = self.live_path();
        let first = self.rotated_path(1);
        match fs::rename(&live, &first) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::Rotation {
                    from: live,
                    to: first,
                    source,
                })
            }
        }

        Ok(outcome)
    }
}

/// ログファイルパスを作成して返却する。
///
/// # 引数
///
/// - directory: ファイルを作成するディレクトリ。
/// - file_name: ログファイル名。
///
/// # 戻り値
///
/// ログファイルパス。
pub fn create_log_filepath(directory: &Path, file_name: &str) -> PathBuf {
    directory.join(file_name)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn touch(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_needs_rotation() {
        assert!(!RotationManager::needs_rotation(100, 100, false));
        assert!(RotationManager::needs_rotation(101, 100, false));
        assert!(!RotationManager::needs_rotation(u64::MAX, 0, false));
        assert!(RotationManager::needs_rotation(0, 0, true));
    }

    #[test]
    fn test_existing_indices() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path(), "foo.log").unwrap();
        for name in ["foo.log", "foo.log.0", "foo.log.2", "foo.log.10", "foo.log.x", "fooXlog.3"] {
            touch(&dir.path().join(name), name);
        }

        assert_eq!(vec![2, 10], manager.existing_indices().unwrap());
    }

    #[test]
    fn test_retention() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path(), "foo.log").unwrap();
        touch(&manager.live_path(), "live");
        touch(&manager.rotated_path(1), "one");
        touch(&manager.rotated_path(2), "two");
        touch(&manager.rotated_path(3), "three");

        let outcome = manager.maybe_rotate(11, 10, 3, false).unwrap().unwrap();

        assert_eq!(vec![3], outcome.deleted);
        assert_eq!(vec![2, 1], outcome.renamed);
        assert!(!manager.live_path().exists());
        assert_eq!("live", fs::read_to_string(manager.rotated_path(1)).unwrap());
        assert_eq!("one", fs::read_to_string(manager.rotated_path(2)).unwrap());
        assert_eq!("two", fs::read_to_string(manager.rotated_path(3)).unwrap());
        assert!(!manager.rotated_path(4).exists());
    }

    #[test]
    fn test_gaps_are_not_filled() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path(), "foo.log").unwrap();
        touch(&manager.live_path(), "live");
        touch(&manager.rotated_path(1), "one");
        touch(&manager.rotated_path(3), "three");

        manager.rotate(0).unwrap();

        assert_eq!(vec![1, 2, 4], manager.existing_indices().unwrap());
        assert_eq!("three", fs::read_to_string(manager.rotated_path(4)).unwrap());
    }

    #[test]
    fn test_no_rotation_below_threshold() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path(), "foo.log").unwrap();
        touch(&manager.live_path(), "live");

        assert_eq!(None, manager.maybe_rotate(10, 10, 3, false).unwrap());
        assert!(manager.live_path().exists());
    }

    #[test]
    fn test_rotate_without_live_file() {
        let dir = TempDir::new().unwrap();
        let manager = RotationManager::new(dir.path(), "foo.log").unwrap();

        let outcome = manager.maybe_rotate(0, 10, 3, true).unwrap().unwrap();

        assert_eq!(RotationOutcome::default(), outcome);
    }
}
