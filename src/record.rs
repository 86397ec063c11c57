//! ログレコード

use std::fmt::Write as _;

use time::OffsetDateTime;

use crate::verbosity::Verbosity;

/// レコードを出力したソースコード上の位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    /// 呼び出し元のモジュール内のアドレス（0は不明）
    pub caller_address: usize,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
}

impl Location {
    pub const fn new(
        caller_address: usize,
        function: &'static str,
        file: &'static str,
        line: u32,
    ) -> Self {
        Self {
            caller_address,
            function,
            file,
            line,
        }
    }

    /// 位置が不明なレコード用
    pub const fn unknown() -> Self {
        Self::new(0, "", "", 0)
    }
}

/// 1件のログ
///
/// 作成した後は変更しない。フォーマッタから書き込みキューにムーブされる。
#[derive(Clone, Debug)]
pub struct LogRecord {
    verbosity: Verbosity,
    location: Location,
    message: String,
    timestamp: OffsetDateTime,
    thread_id: u64,
    process_id: u32,
}

impl LogRecord {
    /// 現在のスレッドと時刻で`LogRecord`を作成する。
    ///
    /// # 引数
    ///
    /// * verbosity: レコードのレベル。
    /// * location: レコードを出力した位置。
    /// * message: 書式化済みの本文。
    /// * timestamp: レコードの時刻。
    ///
    /// # 戻り値
    ///
    /// `LogRecord`インスタンス。
    pub fn new(
        verbosity: Verbosity,
        location: Location,
        message: String,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            verbosity,
            location,
            message,
            timestamp,
            thread_id: current_thread_id(),
            process_id: std::process::id(),
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// ヘッダを付けて、ファイルに出力する1行に変換する。
    pub fn into_line(self, header: &str) -> String {
        compose_line(header, &self.message)
    }
}

/// `{header}{ヘッダが空でなければ空白}{body}\n`を作成する。
pub fn compose_line(header: &str, body: &str) -> String {
    let mut line = String::with_capacity(header.len() + body.len() + 2);
    line.push_str(header);
    if !header.is_empty() {
        line.push(' ');
    }
    line.push_str(body);
    line.push('\n');
    line
}

const DUMP_WIDTH: usize = 16;

/// バイト列を16バイトごとの16進ダンプにする。
///
/// 各行は`OOOO: XX XX ... |ascii`で、`!`より小さいバイトは`.`で表示する。
/// 最後の行も改行で終わる。
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 8);

    for (row, chunk) in data.chunks(DUMP_WIDTH).enumerate() {
        let _ = write!(out, "{:04X}: ", row * DUMP_WIDTH);
        for i in 0..DUMP_WIDTH {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02X} ", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push('|');
        for &b in chunk {
            out.push(if b >= b'!' && b.is_ascii() { b as char } else { '.' });
        }
        out.push('\n');
    }

    out
}

/// OSのスレッドIDを返却する。
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    // SAFETY: gettidは引数を取らず、失敗しない。
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_line() {
        assert_eq!("[INFO] hello\n", compose_line("[INFO]", "hello"));
        assert_eq!("hello\n", compose_line("", "hello"));
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(b"ABC\x00");
        let expected = format!("0000: 41 42 43 00 {}|ABC.\n", "   ".repeat(12));

        assert_eq!(expected, dump);
    }

    #[test]
    fn test_hex_dump_second_row_offset() {
        let data: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&data);
        let rows: Vec<&str> = dump.lines().collect();

        assert_eq!(2, rows.len());
        assert!(rows[1].starts_with("0010: 10 11 12 13 "));
    }
}
