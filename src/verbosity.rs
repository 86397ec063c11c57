//! 出力レベル
//!
//! レベルはビットマスクで、値が小さいほど重大度が高い。
//! 設定のマスクとレコードのレベルの論理積が0でない場合に、レコードを出力する。

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// 出力レベル（ビットマスク）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Verbosity(u32);

impl Verbosity {
    pub const MUTE: Verbosity = Verbosity(0);
    pub const FATAL: Verbosity = Verbosity(1);
    pub const ERROR: Verbosity = Verbosity(2);
    pub const WARNING: Verbosity = Verbosity(4);
    pub const INFO: Verbosity = Verbosity(8);
    pub const DEBUG: Verbosity = Verbosity(16);

    pub const FATAL_ERROR: Verbosity = Verbosity(1 | 2);
    pub const NORMAL: Verbosity = Verbosity(1 | 2 | 4 | 8);
    pub const ALL: Verbosity = Verbosity(1 | 2 | 4 | 8 | 16);

    /// デバッグビルドでは`DEBUG`を含む。
    #[cfg(debug_assertions)]
    pub const OPTIMAL: Verbosity = Verbosity::ALL;
    #[cfg(not(debug_assertions))]
    pub const OPTIMAL: Verbosity = Verbosity::NORMAL;

    pub const fn from_bits(bits: u32) -> Verbosity {
        Verbosity(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// マスクが`level`のレコードを許可するか確認する。
    ///
    /// # 引数
    ///
    /// * level: レコードのレベル。
    ///
    /// # 戻り値
    ///
    /// 論理積が0でない場合は`true`。
    pub const fn allows(self, level: Verbosity) -> bool {
        self.0 & level.0 != 0
    }

    /// ヘッダの`$(V)`に出力する名前を返却する。
    ///
    /// 単一のレベル以外の値は`DEBUG`になる。
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "MUTE",
            1 => "FATAL",
            2 => "ERROR",
            4 => "WARNING",
            8 => "INFO",
            _ => "DEBUG",
        }
    }
}

impl BitOr for Verbosity {
    type Output = Verbosity;

    fn bitor(self, rhs: Verbosity) -> Verbosity {
        Verbosity(self.0 | rhs.0)
    }
}

impl BitOrAssign for Verbosity {
    fn bitor_assign(&mut self, rhs: Verbosity) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Verbosity {
    type Output = Verbosity;

    fn bitand(self, rhs: Verbosity) -> Verbosity {
        Verbosity(self.0 & rhs.0)
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
