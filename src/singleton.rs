//! 共有領域によるロガーインスタンスの共有
//!
//! 同じプロセスに読み込まれた複数のモジュールが、固定アドレスの共有領域を通じて1つの
//! ロガーインスタンスを共有する。
//!
//! 識別子ごとに`REGION_BASE + (id << ID_SHIFT)`から始まるアドレスの範囲を割り当て、
//! `REGION_STRIDE`間隔の`REGION_CANDIDATES`個のアドレスを候補とする。
//! 領域の先頭には2つのシグネチャとポインタを格納する。
//!
//! 固定アドレスへのマッピングはアドレス空間配置のランダム化の影響を受けるため、
//! 共有は保証されない。共有できない場合、呼び出し元は共有しないインスタンスを使用する。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::probe::{self, MemoryMap, Protection};

pub const REGION_BASE: usize = 0x0432_0000;
pub const REGION_STRIDE: usize = 0x10_0000;
pub const REGION_CANDIDATES: usize = 0x30;
/// 識別子ごとの範囲は64MiBで、候補の範囲（48MiB）と重ならない
pub const ID_SHIFT: u32 = 26;
/// 領域のサイズ（マップする長さはページサイズに切り上げる）
pub const REGION_SIZE: usize = 0x100;

pub const SIGNATURE_1: u32 = 0x1234_5678;
pub const SIGNATURE_2: u32 = 0xA0B0_C0D0;

/// 領域の先頭に格納する値
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionHeader {
    pub signature_1: u32,
    pub signature_2: u32,
    pub slot: usize,
}

impl RegionHeader {
    pub const fn signed(slot: usize) -> Self {
        Self {
            signature_1: SIGNATURE_1,
            signature_2: SIGNATURE_2,
            slot,
        }
    }

    pub const fn is_signed(&self) -> bool {
        self.signature_1 == SIGNATURE_1 && self.signature_2 == SIGNATURE_2
    }
}

/// 共有領域を配置するアドレス空間
pub trait AddressSpace: Send + Sync {
    fn page_size(&self) -> usize;

    /// `None`の場合、アドレスはマップされていない。
    fn protection(&self, address: usize) -> Option<Protection>;

    /// `address`に読み書き可能なページをマップする。
    ///
    /// 既にマップされているなどの理由で、そのアドレスにマップできない場合はエラーを返却する。
    /// 別のアドレスにはマップしない。
    fn map_fixed(&self, address: usize, len: usize) -> Result<()>;

    fn unmap(&self, address: usize, len: usize) -> Result<()>;

    /// 読み書き可能と確認した領域の先頭を読み取る。
    fn read_header(&self, address: usize) -> Option<RegionHeader>;

    fn write_header(&self, address: usize, header: RegionHeader);
}

/// 現在のプロセスのアドレス空間
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessAddressSpace;

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int =
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

impl AddressSpace for ProcessAddressSpace {
    fn page_size(&self) -> usize {
        probe::page_size()
    }

    fn protection(&self, address: usize) -> Option<Protection> {
        MemoryMap::current().ok()?.protection_at(address)
    }

    fn map_fixed(&self, address: usize, len: usize) -> Result<()> {
        // SAFETY: 匿名マッピングで、既存のマッピングを置き換えない。
        let mapped = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(Error::RegionUnavailable { address });
        }
        if mapped as usize != address {
            // 要求と異なるアドレスにマップされた
            // SAFETY: 直前にマップした範囲を解放する。
            unsafe { libc::munmap(mapped, len) };
            return Err(Error::RegionUnavailable { address });
        }
        Ok(())
    }

    fn unmap(&self, address: usize, len: usize) -> Result<()> {
        // SAFETY: `map_fixed`でマップした範囲だけを解放する。
        if unsafe { libc::munmap(address as *mut libc::c_void, len) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn read_header(&self, address: usize) -> Option<RegionHeader> {
        if !self.protection(address)?.is_read_write() {
            return None;
        }
        // SAFETY: メモリマップが領域を読み書き可能と報告している。
        unsafe {
            Some(RegionHeader {
                signature_1: std::ptr::read_volatile(address as *const u32),
                signature_2: std::ptr::read_volatile((address + 4) as *const u32),
                slot: std::ptr::read_volatile((address + 8) as *const usize),
            })
        }
    }

    fn write_header(&self, address: usize, header: RegionHeader) {
        // SAFETY: `map_fixed`でマップした、読み書き可能な領域にだけ書き込む。
        unsafe {
            std::ptr::write_volatile((address + 8) as *mut usize, header.slot);
            std::ptr::write_volatile((address + 4) as *mut u32, header.signature_2);
            std::ptr::write_volatile(address as *mut u32, header.signature_1);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SimulatedRegion {
    len: usize,
    header: RegionHeader,
}

/// メモリ上で模倣したアドレス空間
///
/// 複製したインスタンスは同じアドレス空間を参照するため、同じ空間を共有する
/// 複数の参加者を模倣できる。
#[derive(Clone, Debug, Default)]
pub struct SimulatedAddressSpace {
    regions: Arc<Mutex<BTreeMap<usize, SimulatedRegion>>>,
}

impl SimulatedAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// 領域以外の用途でアドレスを使用済みにする。
    pub fn occupy(&self, address: usize, len: usize) {
        self.regions.lock().insert(
            address,
            SimulatedRegion {
                len,
                header: RegionHeader::default(),
            },
        );
    }

    fn find(&self, address: usize) -> Option<(usize, SimulatedRegion)> {
        self.regions
            .lock()
            .range(..=address)
            .next_back()
            .filter(|(start, region)| address < **start + region.len)
            .map(|(start, region)| (*start, *region))
    }
}

impl AddressSpace for SimulatedAddressSpace {
    fn page_size(&self) -> usize {
        4096
    }

    fn protection(&self, address: usize) -> Option<Protection> {
        self.find(address).map(|_| Protection::read_write())
    }

    fn map_fixed(&self, address: usize, len: usize) -> Result<()> {
        let mut regions = self.regions.lock();
        let end = address + len;
        let taken = regions
            .range(..end)
            .next_back()
            .map_or(false, |(start, region)| address < *start + region.len);
        if taken {
            return Err(Error::RegionUnavailable { address });
        }
        regions.insert(
            address,
            SimulatedRegion {
                len,
                header: RegionHeader::default(),
            },
        );
        Ok(())
    }

    fn unmap(&self, address: usize, _len: usize) -> Result<()> {
        self.regions
            .lock()
            .remove(&address)
            .map(|_| ())
            .ok_or(Error::RegionUnavailable { address })
    }

    fn read_header(&self, address: usize) -> Option<RegionHeader> {
        self.find(address)
            .filter(|(start, _)| *start == address)
            .map(|(_, region)| region.header)
    }

    fn write_header(&self, address: usize, header: RegionHeader) {
        if let Some(region) = self.regions.lock().get_mut(&address) {
            region.header = header;
        }
    }
}

/// 共有領域を探す、または作成する。
#[derive(Clone, Debug, Default)]
pub struct SingletonLocator<S> {
    space: S,
}

impl<S: AddressSpace> SingletonLocator<S> {
    pub fn new(space: S) -> Self {
        Self { space }
    }

    /// 識別子に割り当てた範囲の先頭アドレス
    pub fn window_base(id: u8) -> usize {
        REGION_BASE + ((id as usize) << ID_SHIFT)
    }

    /// 候補のアドレス
    pub fn candidates(id: u8) -> impl Iterator<Item = usize> {
        let base = Self::window_base(id);
        (0..REGION_CANDIDATES).map(move |i| base + i * REGION_STRIDE)
    }

    fn mapped_len(&self) -> usize {
        let page = self.space.page_size();
        (REGION_SIZE + page - 1) / page * page
    }

    /// 署名された領域を探し、そのアドレスと格納された値を返却する。
    pub fn locate_region(&self, id: u8) -> Option<(usize, usize)> {
        Self::candidates(id).find_map(|address| {
            let protection = self.space.protection(address)?;
            if !protection.is_read_write() {
                return None;
            }
            let header = self.space.read_header(address)?;
            header.is_signed().then_some((address, header.slot))
        })
    }

    /// 共有領域を探す。
    ///
    /// # 引数
    ///
    /// * id: 共有領域の識別子。
    ///
    /// # 戻り値
    ///
    /// 最初に見つかった署名された領域に格納された値。
    pub fn locate(&self, id: u8) -> Option<usize> {
        self.locate_region(id).map(|(_, value)| value)
    }

    /// 最初の空いている候補に領域を作成して、値を格納する。
    ///
    /// 候補のアドレスにマップできない場合は、次の候補を試す。
    ///
    /// # 引数
    ///
    /// * id: 共有領域の識別子。
    /// * value: 格納する値。
    ///
    /// # 戻り値
    ///
    /// 作成した領域のアドレス。すべての候補が使用済みの場合は`None`。
    pub fn publish(&self, id: u8, value: usize) -> Option<usize> {
        let len = self.mapped_len();

        for address in Self::candidates(id) {
            if self.space.protection(address).is_some() {
                continue;
            }
            match self.space.map_fixed(address, len) {
                Ok(()) => {
                    self.space.write_header(address, RegionHeader::signed(value));
                    return Some(address);
                }
                Err(e) => {
                    tracing::debug!(target: "restricted_rolling_logger", "{}", e);
                }
            }
        }

        None
    }

    /// 識別子の最初の署名された領域を解放する。
    ///
    /// # 戻り値
    ///
    /// 解放した場合は`true`。
    pub fn retract(&self, id: u8) -> bool {
        match self.locate_region(id) {
            Some((address, _)) => self.retract_at(address),
            None => false,
        }
    }

    /// 指定したアドレスの領域を解放する。
    pub fn retract_at(&self, address: usize) -> bool {
        match self.space.read_header(address) {
            Some(header) if header.is_signed() => {
                self.space.write_header(address, RegionHeader::default());
                self.space.unmap(address, self.mapped_len()).is_ok()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_windows_are_disjoint() {
        type Locator = SingletonLocator<SimulatedAddressSpace>;

        let last_of_first = Locator::candidates(0).last().unwrap();
        assert_eq!(REGION_BASE, Locator::window_base(0));
        assert!(last_of_first + REGION_STRIDE <= Locator::window_base(1));
    }

    #[test]
    fn test_locate_after_publish() {
        let locator = SingletonLocator::new(SimulatedAddressSpace::new());

        assert_eq!(None, locator.locate(0));
        let region = locator.publish(0, 0xdead_beef).unwrap();

        assert_eq!(REGION_BASE, region);
        assert_eq!(Some(0xdead_beef), locator.locate(0));
        assert_eq!(None, locator.locate(1));
    }

    #[test]
    fn test_two_participants_never_share_an_address() {
        let space = SimulatedAddressSpace::new();
        let first = SingletonLocator::new(space.clone());
        let second = SingletonLocator::new(space);

        let a = first.publish(3, 1).unwrap();
        let b = second.publish(3, 2).unwrap();

        assert_ne!(a, b);
        assert_eq!(Some(1), second.locate(3));
    }

    #[test]
    fn test_concurrent_publish() {
        let space = SimulatedAddressSpace::new();
        let handles: Vec<_> = (0..8usize)
            .map(|n| {
                let locator = SingletonLocator::new(space.clone());
                thread::spawn(move || locator.publish(2, n + 1))
            })
            .collect();
        let mut regions: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        regions.sort_unstable();
        regions.dedup();

        assert_eq!(8, regions.len());
    }

    #[test]
    fn test_unsigned_regions_are_skipped() {
        let space = SimulatedAddressSpace::new();
        space.occupy(REGION_BASE, 0x1000);
        let locator = SingletonLocator::new(space);

        assert_eq!(None, locator.locate(0));
        assert_eq!(Some(REGION_BASE + REGION_STRIDE), locator.publish(0, 7));
        assert_eq!(Some(7), locator.locate(0));
    }

    #[test]
    fn test_retract() {
        let locator = SingletonLocator::new(SimulatedAddressSpace::new());
        locator.publish(0, 7).unwrap();

        assert!(locator.retract(0));
        assert_eq!(None, locator.locate(0));
        assert!(!locator.retract(0));
    }

    #[test]
    fn test_all_candidates_taken() {
        let space = SimulatedAddressSpace::new();
        for address in SingletonLocator::<SimulatedAddressSpace>::candidates(4) {
            space.occupy(address, 0x1000);
        }
        let locator = SingletonLocator::new(space);

        assert_eq!(None, locator.publish(4, 7));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_address_space_round_trip() {
        let locator = SingletonLocator::new(ProcessAddressSpace);
        // 他のテストと重ならない識別子
        let id = 11;

        let region = locator.publish(id, 0x1234).unwrap();
        assert_eq!(Some(0x1234), locator.locate(id));
        assert!(locator.retract_at(region));
        assert_eq!(None, locator.locate(id));
    }
}
