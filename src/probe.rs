//! メモリプローブ
//!
//! 生ポインタを扱う処理は、このモジュールに閉じ込める。
//!
//! プローブは`/proc/self/maps`のスナップショットで読み取り可能と報告されたページだけを
//! 読み取る。読み取れないページに当たった回数を「失敗したプローブ」として数え、
//! ページ数または失敗回数が上限に達したら探索を中止する。

use std::fs;
use std::io;

/// ページの保護属性
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            exec: false,
        }
    }

    /// 読み書き可能か確認する（実行可能かは問わない）。
    pub const fn is_read_write(self) -> bool {
        self.read && self.write
    }
}

/// マップされたアドレス範囲`[start, end)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedRange {
    pub start: usize,
    pub end: usize,
    pub protection: Protection,
    pub offset: u64,
    pub path: Option<String>,
}

impl MappedRange {
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }
}

/// プロセスのメモリマップ
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    ranges: Vec<MappedRange>,
}

impl MemoryMap {
    /// 現在のプロセスのメモリマップを読み込む。
    pub fn current() -> io::Result<Self> {
        let text = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::parse(&text))
    }

    /// `/proc/<pid>/maps`形式のテキストを解析する。
    ///
    /// 解析できない行は無視する。
    ///
    /// # 引数
    ///
    /// * text: `08048000-0804c000 r-xp 00000000 03:03 1010107    /bin/cat`形式の行の並び。
    ///
    /// # 戻り値
    ///
    /// `MemoryMap`インスタンス。
    pub fn parse(text: &str) -> Self {
        let ranges = text.lines().filter_map(parse_line).collect();
        Self { ranges }
    }

    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    pub fn range_at(&self, address: usize) -> Option<&MappedRange> {
        self.ranges.iter().find(|r| r.contains(address))
    }

    /// `None`の場合、アドレスはマップされていない。
    pub fn protection_at(&self, address: usize) -> Option<Protection> {
        self.range_at(address).map(|r| r.protection)
    }
}

fn parse_line(line: &str) -> Option<MappedRange> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    let offset = fields.next()?;
    // デバイスとinode
    fields.next()?;
    fields.next()?;
    let path: Vec<&str> = fields.collect();

    Some(MappedRange {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        protection: Protection {
            read: perms.first() == Some(&b'r'),
            write: perms.get(1) == Some(&b'w'),
            exec: perms.get(2) == Some(&b'x'),
        },
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: (!path.is_empty()).then(|| path.join(" ")),
    })
}

/// ページサイズを返却する。
pub fn page_size() -> usize {
    // SAFETY: sysconfは引数の値を読むだけ。
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// バイナリイメージの先頭を示すシグネチャ
pub const ELF_SIGNATURE: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// 探索の上限
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeLimits {
    /// 調べるページ数の上限
    pub max_pages: usize,
    /// 読み取れないページに当たった回数の上限
    pub max_faults: usize,
}

impl Default for ProbeLimits {
    fn default() -> Self {
        Self {
            max_pages: 0x4000,
            max_faults: 16,
        }
    }
}

/// `address`以下で最も近い、ページ境界にあるイメージのシグネチャを探す。
///
/// # 引数
///
/// * map: 読み取り可能なページを判定するメモリマップ。
/// * address: 探索を開始するアドレス。
/// * page_size: ページサイズ。
/// * limits: 探索の上限。
///
/// # 戻り値
///
/// 見つかったイメージの先頭アドレス。
pub fn find_image_base(
    map: &MemoryMap,
    address: usize,
    page_size: usize,
    limits: ProbeLimits,
) -> Option<usize> {
    let mut page = address & !(page_size - 1);
    let mut faults = 0;

    for _ in 0..limits.max_pages {
        match map.protection_at(page) {
            Some(p) if p.read => {
                // SAFETY: メモリマップがこのページを読み取り可能と報告している。
                let head = unsafe { read_bytes::<4>(page) };
                if head == ELF_SIGNATURE {
                    return Some(page);
                }
            }
            _ => {
                faults += 1;
                if faults >= limits.max_faults {
                    return None;
                }
            }
        }

        page = page.checked_sub(page_size)?;
    }

    None
}

/// `address`から`N`バイトを読み取る。
///
/// # Safety
///
/// `address..address + N`がマップされていて、読み取り可能であること。
pub unsafe fn read_bytes<const N: usize>(address: usize) -> [u8; N] {
    std::ptr::read_volatile(address as *const [u8; N])
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
00651000-00652000 rw-p 00051000 08:02 173521      /usr/bin/dbus-daemon
7f2c4e000000-7f2c4e021000 rw-p 00000000 00:00 0
7ffd1c3fe000-7ffd1c41f000 rw-p 00000000 00:00 0     [stack]
broken line
";

    #[test]
    fn test_parse_maps() {
        let map = MemoryMap::parse(MAPS);

        assert_eq!(4, map.ranges().len());
        let first = &map.ranges()[0];
        assert_eq!(0x0040_0000, first.start);
        assert_eq!(
            Protection {
                read: true,
                write: false,
                exec: true
            },
            first.protection
        );
        assert_eq!(Some("/usr/bin/dbus-daemon"), first.path.as_deref());
        assert_eq!(None, map.ranges()[2].path);
        assert_eq!(Some("[stack]"), map.ranges()[3].path.as_deref());
    }

    #[test]
    fn test_protection_at() {
        let map = MemoryMap::parse(MAPS);

        assert!(map.protection_at(0x0065_1800).unwrap().is_read_write());
        assert_eq!(None, map.protection_at(0x0065_2000));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_find_image_base_of_own_code() {
        let map = MemoryMap::current().unwrap();
        let address = test_find_image_base_of_own_code as usize;
        let base = find_image_base(&map, address, page_size(), ProbeLimits::default());

        let range = map.range_at(address).unwrap();
        let image = map
            .ranges()
            .iter()
            .filter(|r| r.path == range.path && r.offset == 0)
            .map(|r| r.start)
            .min();
        assert_eq!(image, base);
    }

    #[test]
    fn test_find_image_base_gives_up_on_unmapped_pages() {
        let map = MemoryMap::parse("");
        let limits = ProbeLimits {
            max_pages: 100,
            max_faults: 3,
        };

        assert_eq!(None, find_image_base(&map, 0x10_0000, 4096, limits));
    }
}
