//! モジュールの特定
//!
//! 命令のアドレスから、そのアドレスを含むロード済みモジュール（実行ファイルや共有ライブラリ）
//! の名前を求める。
//!
//! 一度列挙したモジュールのアドレス範囲はキャッシュする。キャッシュはモジュールの
//! アンロードを追跡しないため、アンロードされたモジュールの範囲も残り続ける。

use std::ffi::CStr;

use parking_lot::RwLock;

use crate::probe::{self, MemoryMap, ProbeLimits};

/// ロード済みモジュール
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: usize,
    pub size: usize,
    /// モジュールのフルパス
    pub name: String,
}

/// ロード済みモジュールを列挙する。
pub trait ModuleEnumerator: Send + Sync {
    fn loaded_modules(&self) -> Vec<ModuleInfo>;
}

/// アドレスから直接モジュールを特定する。
pub trait AddressResolver: Send + Sync {
    fn module_for(&self, address: usize) -> Option<String>;
}

/// 動的リンカが管理するモジュールを列挙する。
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadedModules;

#[cfg(target_os = "linux")]
impl ModuleEnumerator for LoadedModules {
    fn loaded_modules(&self) -> Vec<ModuleInfo> {
        unsafe extern "C" fn callback(
            info: *mut libc::dl_phdr_info,
            size: libc::size_t,
            data: *mut libc::c_void,
        ) -> libc::c_int {
            if info.is_null() || size < std::mem::size_of::<libc::dl_phdr_info>() {
                return 0;
            }
            // SAFETY: dl_iterate_phdrは有効なdl_phdr_infoを渡し、dataは下のVecを指す。
            let info = &*info;
            let modules = &mut *(data as *mut Vec<ModuleInfo>);

            let mut size = 0usize;
            if !info.dlpi_phdr.is_null() {
                let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
                for header in headers {
                    size = size.max((header.p_vaddr + header.p_memsz) as usize);
                }
            }

            let name = if info.dlpi_name.is_null() {
                String::new()
            } else {
                CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
            };

            modules.push(ModuleInfo {
                base: info.dlpi_addr as usize,
                size,
                name,
            });
            0
        }

        let mut modules: Vec<ModuleInfo> = Vec::new();
        // SAFETY: コールバックはdl_iterate_phdrの間だけmodulesを参照する。
        unsafe {
            libc::dl_iterate_phdr(
                Some(callback),
                &mut modules as *mut Vec<ModuleInfo> as *mut libc::c_void,
            );
        }

        // 実行ファイル自身は名前が空で報告される。
        let exe = std::env::current_exe()
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        for module in modules.iter_mut().filter(|m| m.name.is_empty()) {
            if let Some(exe) = &exe {
                module.name = exe.clone();
            }
        }
        modules.retain(|m| !m.name.is_empty() && m.size > 0);
        modules
    }
}

#[cfg(not(target_os = "linux"))]
impl ModuleEnumerator for LoadedModules {
    fn loaded_modules(&self) -> Vec<ModuleInfo> {
        Vec::new()
    }
}

/// `dladdr`でモジュールを特定し、失敗した場合はメモリ上のイメージのシグネチャを探す。
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicLinkerResolver {
    limits: ProbeLimits,
}

impl DynamicLinkerResolver {
    pub fn new(limits: ProbeLimits) -> Self {
        Self { limits }
    }

    /// イメージの先頭を探し、その範囲をマップしているファイルの名前を返却する。
    fn probe_image(&self, address: usize) -> Option<String> {
        let map = MemoryMap::current().ok()?;
        let base = probe::find_image_base(&map, address, probe::page_size(), self.limits)?;
        map.range_at(base)?.path.clone()
    }
}

impl AddressResolver for DynamicLinkerResolver {
    fn module_for(&self, address: usize) -> Option<String> {
        match linker_symbol(address).and_then(|symbol| symbol.module) {
            Some(module) => Some(module),
            None if address != 0 => self.probe_image(address),
            None => None,
        }
    }
}

/// 動的リンカが報告する、アドレスを含むモジュールとシンボル
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkerSymbol {
    /// モジュールのフルパス
    pub module: Option<String>,
    /// デマングルしたシンボル名
    pub name: Option<String>,
    /// シンボルの先頭からのオフセット
    pub offset: usize,
}

/// `dladdr`でアドレスのモジュールとシンボルを求める。
///
/// デバッグ情報は読まないため、エクスポートされたシンボルだけが見つかる。
/// シグナルハンドラの中からも呼び出せる。
///
/// # 引数
///
/// * address: 命令のアドレス。
///
/// # 戻り値
///
/// 動的リンカが知らないアドレスの場合は`None`。
#[cfg(unix)]
pub fn linker_symbol(address: usize) -> Option<LinkerSymbol> {
    if address == 0 {
        return None;
    }

    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdrはアドレスを参照せず、infoに書き込むだけ。
    if unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } == 0 {
        return None;
    }

    // SAFETY: dli_fnameとdli_snameは動的リンカが保持するNUL終端文字列。
    let module = (!info.dli_fname.is_null())
        .then(|| unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned());
    let name = (!info.dli_sname.is_null()).then(|| {
        let raw = unsafe { CStr::from_ptr(info.dli_sname) };
        backtrace::SymbolName::new(raw.to_bytes()).to_string()
    });
    let offset = if info.dli_saddr.is_null() {
        0
    } else {
        address.saturating_sub(info.dli_saddr as usize)
    };

    Some(LinkerSymbol {
        module,
        name,
        offset,
    })
}

#[cfg(not(unix))]
pub fn linker_symbol(_address: usize) -> Option<LinkerSymbol> {
    None
}

/// キャッシュしたモジュールのアドレス範囲`[base, end)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCacheEntry {
    pub base: usize,
    pub end: usize,
    pub name: String,
}

impl ModuleCacheEntry {
    fn contains(&self, address: usize) -> bool {
        self.base <= address && address < self.end
    }

    fn overlaps(&self, base: usize, end: usize) -> bool {
        self.base < end && base < self.end
    }
}

/// アドレスからモジュール名を求める。
pub struct ModuleResolver {
    enumerator: Box<dyn ModuleEnumerator>,
    direct: Box<dyn AddressResolver>,
    cache: RwLock<Vec<ModuleCacheEntry>>,
}

impl ModuleResolver {
    pub fn new(enumerator: Box<dyn ModuleEnumerator>, direct: Box<dyn AddressResolver>) -> Self {
        Self {
            enumerator,
            direct,
            cache: RwLock::new(Vec::new()),
        }
    }

    /// 動的リンカを使う`ModuleResolver`を作成する。
    pub fn system() -> Self {
        Self::new(
            Box::new(LoadedModules),
            Box::new(DynamicLinkerResolver::default()),
        )
    }

    /// アドレスを含むモジュールの名前を返却する。
    ///
    /// キャッシュに無い場合だけ、全モジュールを列挙してキャッシュに追加する。
    /// 列挙しても見つからない場合は、アドレスから直接特定する。
    ///
    /// # 引数
    ///
    /// * address: 命令のアドレス。
    ///
    /// # 戻り値
    ///
    /// モジュールのフルパス。特定できない場合は空文字列。
    pub fn module_name_for(&self, address: usize) -> String {
        if address == 0 {
            return String::new();
        }
        if let Some(name) = self.cached(address) {
            return name;
        }

        self.refresh();
        if let Some(name) = self.cached(address) {
            return name;
        }

        self.direct.module_for(address).unwrap_or_default()
    }

    fn cached(&self, address: usize) -> Option<String> {
        self.cache
            .read()
            .iter()
            .find(|e| e.contains(address))
            .map(|e| e.name.clone())
    }

    /// 列挙したモジュールのうち、既存の範囲と重ならないものをキャッシュに追加する。
    fn refresh(&self) {
        let modules = self.enumerator.loaded_modules();
        let mut cache = self.cache.write();

        for module in modules {
            let end = module.base.saturating_add(module.size);
            if module.size == 0 || cache.iter().any(|e| e.overlaps(module.base, end)) {
                continue;
            }
            cache.push(ModuleCacheEntry {
                base: module.base,
                end,
                name: module.name,
            });
        }
    }

    /// ロード済みモジュールを列挙する。
    pub fn loaded_modules(&self) -> Vec<ModuleInfo> {
        self.enumerator.loaded_modules()
    }

    pub fn cache_entries(&self) -> Vec<ModuleCacheEntry> {
        self.cache.read().clone()
    }
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::system()
    }
}

/// モジュール一覧を表形式の文字列にする。
pub fn format_module_table(modules: &[ModuleInfo]) -> String {
    let mut out = String::from("Base\tSize\tModule name\tImage name\n");
    out.push_str("------------------------------------------------\n");

    for module in modules {
        let short = crate::header::short_module_name(&module.name);
        out.push_str(&format!(
            "{:#018x}\t{}\t{}\t{}\n",
            module.base, module.size, short, module.name
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingEnumerator {
        calls: Arc<AtomicUsize>,
        modules: Vec<ModuleInfo>,
    }

    impl ModuleEnumerator for CountingEnumerator {
        fn loaded_modules(&self) -> Vec<ModuleInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.modules.clone()
        }
    }

    struct NoResolver;

    impl AddressResolver for NoResolver {
        fn module_for(&self, _address: usize) -> Option<String> {
            None
        }
    }

    fn resolver(calls: &Arc<AtomicUsize>) -> ModuleResolver {
        let modules = vec![
            ModuleInfo {
                base: 0x1000,
                size: 0x1000,
                name: "/usr/lib/liba.so".to_string(),
            },
            ModuleInfo {
                base: 0x1800,
                size: 0x1000,
                name: "/usr/lib/overlapping.so".to_string(),
            },
            ModuleInfo {
                base: 0x4000,
                size: 0x2000,
                name: "/usr/bin/app".to_string(),
            },
        ];
        ModuleResolver::new(
            Box::new(CountingEnumerator {
                calls: Arc::clone(calls),
                modules,
            }),
            Box::new(NoResolver),
        )
    }

    #[test]
    fn test_cached_range_skips_enumeration() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(&calls);

        assert_eq!("/usr/lib/liba.so", resolver.module_name_for(0x1004));
        assert_eq!(1, calls.load(Ordering::SeqCst));

        assert_eq!("/usr/lib/liba.so", resolver.module_name_for(0x1fff));
        assert_eq!("/usr/bin/app", resolver.module_name_for(0x5000));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn test_overlapping_modules_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(&calls);
        resolver.module_name_for(0x1004);

        let names: Vec<String> = resolver
            .cache_entries()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(vec!["/usr/lib/liba.so", "/usr/bin/app"], names);
    }

    #[test]
    fn test_unknown_address() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = resolver(&calls);

        assert_eq!("", resolver.module_name_for(0x9000));
        assert_eq!("", resolver.module_name_for(0));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linker_symbol_of_own_function() {
        let symbol = linker_symbol(test_linker_symbol_of_own_function as usize).unwrap();
        let exe = std::env::current_exe().unwrap();
        let exe_name = exe.file_name().unwrap().to_string_lossy();

        assert!(symbol.module.unwrap().ends_with(exe_name.as_ref()));
        assert_eq!(None, linker_symbol(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_resolver_finds_own_image() {
        let resolver = ModuleResolver::system();
        let name = resolver.module_name_for(test_system_resolver_finds_own_image as usize);
        let exe = std::env::current_exe().unwrap();
        let exe_name = exe.file_name().unwrap().to_string_lossy();

        assert!(name.ends_with(exe_name.as_ref()), "{} vs {}", name, exe_name);
    }
}
