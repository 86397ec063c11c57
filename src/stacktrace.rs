//! スタックトレース
//!
//! アドレスの収集とシンボルの解決を分けている。クラッシュ時はシグナルハンドラの中で
//! アドレスだけを固定長の配列に収集し、シンボルの解決は後で行う。

use std::fmt;

use crate::module_resolver::{self, ModuleResolver};

/// 収集するフレームの最大数
pub const MAX_FRAMES: usize = 128;

/// 収集したフレームのアドレス
#[derive(Clone, Copy)]
pub struct FrameAddresses {
    addresses: [usize; MAX_FRAMES],
    len: usize,
}

impl FrameAddresses {
    pub const fn new() -> Self {
        Self {
            addresses: [0; MAX_FRAMES],
            len: 0,
        }
    }

    fn push(&mut self, address: usize) -> bool {
        if self.len == MAX_FRAMES {
            return false;
        }
        self.addresses[self.len] = address;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.addresses[..self.len]
    }
}

impl Default for FrameAddresses {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|a| format!("{:#x}", a)))
            .finish()
    }
}

/// 現在のスレッドのフレームのアドレスを収集する。
///
/// # 引数
///
/// * skip: 先頭から読み飛ばすフレーム数。
pub fn capture_addresses(skip: usize) -> FrameAddresses {
    let mut frames = FrameAddresses::new();
    let mut skipped = 0;

    backtrace::trace(|frame| {
        if skipped < skip {
            skipped += 1;
            return true;
        }
        frames.push(frame.ip() as usize)
    });

    frames
}

/// ロックを獲得しないで、現在のスレッドのフレームのアドレスを収集する。
///
/// メモリを確保しない。
///
/// # Safety
///
/// 他のスレッドが同時にスタックを走査していないこと。シグナルハンドラの中で、
/// プロセスを終了する直前にだけ呼び出す。
pub unsafe fn capture_addresses_unsynchronized() -> FrameAddresses {
    let mut frames = FrameAddresses::new();

    backtrace::trace_unsynchronized(|frame| frames.push(frame.ip() as usize));

    frames
}

/// 1つのフレーム
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    pub program_counter: usize,
    /// デマングルした関数名
    pub symbol: Option<String>,
    /// 関数の先頭からのオフセット
    pub symbol_offset: usize,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// モジュールのフルパス
    pub module: String,
}

impl fmt::Display for StackFrame {
    /// ` [i] <-- (0xPC) symbol+0xoff [file:line] [Mod: name]`形式で出力する。
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " [{}] <-- ({:#x})", self.index, self.program_counter)?;
        if let Some(symbol) = &self.symbol {
            write!(f, " {}+{:#x}", symbol, self.symbol_offset)?;
        }
        if let Some(file) = &self.file {
            match self.line {
                Some(line) => write!(f, " [{}:{}]", file, line)?,
                None => write!(f, " [{}]", file)?,
            }
        }
        if !self.module.is_empty() {
            write!(f, " [Mod: {}]", self.module)?;
        }
        Ok(())
    }
}

/// アドレスの関数名、ソースファイル、モジュールを解決する。
///
/// シンボル情報が無いフレームは、アドレスとモジュールだけになる。
///
/// # 引数
///
/// * addresses: フレームのアドレス。
/// * modules: モジュールを特定する`ModuleResolver`。
///
/// # 戻り値
///
/// フレームの一覧。
pub fn symbolicate(addresses: &[usize], modules: &ModuleResolver) -> Vec<StackFrame> {
    addresses
        .iter()
        .enumerate()
        .map(|(index, &address)| {
            let mut frame = StackFrame {
                index,
                program_counter: address,
                module: modules.module_name_for(address),
                ..StackFrame::default()
            };

            backtrace::resolve(address as *mut std::ffi::c_void, |symbol| {
                if frame.symbol.is_some() {
                    return;
                }
                frame.symbol = symbol.name().map(|name| name.to_string());
                frame.symbol_offset = symbol
                    .addr()
                    .map(|start| address.saturating_sub(start as usize))
                    .unwrap_or(0);
                frame.file = symbol.filename().map(|p| p.display().to_string());
                frame.line = symbol.lineno();
            });

            frame
        })
        .collect()
}

/// 動的リンカの情報だけで、フレームを解決する。
///
/// デバッグ情報を読まないため、ソースファイルと行番号は解決しない。
/// シグナルハンドラの中では`symbolicate`ではなく、こちらを使う。
pub fn symbolicate_with_linker(addresses: &[usize], modules: &ModuleResolver) -> Vec<StackFrame> {
    addresses
        .iter()
        .enumerate()
        .map(|(index, &address)| {
            let symbol = module_resolver::linker_symbol(address).unwrap_or_default();
            let module = match symbol.module {
                Some(module) => module,
                None => modules.module_name_for(address),
            };

            StackFrame {
                index,
                program_counter: address,
                symbol: symbol.name,
                symbol_offset: symbol.offset,
                module,
                ..StackFrame::default()
            }
        })
        .collect()
}

/// 現在のスレッドのスタックトレースを作成する。
pub fn capture(skip: usize, modules: &ModuleResolver) -> Vec<StackFrame> {
    // この関数自身を読み飛ばす
    let addresses = capture_addresses(skip + 1);
    symbolicate(addresses.as_slice(), modules)
}

/// フレームを1行ずつ出力する。
pub fn render(frames: &[StackFrame]) -> String {
    frames
        .iter()
        .map(|frame| frame.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_frame() {
        let frame = StackFrame {
            index: 2,
            program_counter: 0x55d0,
            symbol: Some("app::main".to_string()),
            symbol_offset: 0x1c,
            file: Some("src/main.rs".to_string()),
            line: Some(10),
            module: "/usr/bin/app".to_string(),
        };

        assert_eq!(
            " [2] <-- (0x55d0) app::main+0x1c [src/main.rs:10] [Mod: /usr/bin/app]",
            frame.to_string()
        );
    }

    #[test]
    fn test_render_frame_without_symbols() {
        let frame = StackFrame {
            index: 0,
            program_counter: 0x10,
            ..StackFrame::default()
        };

        assert_eq!(" [0] <-- (0x10)", frame.to_string());
    }

    #[test]
    fn test_capture_current_thread() {
        let modules = ModuleResolver::system();
        let frames = capture(0, &modules);

        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.program_counter != 0));
        assert_eq!((0..frames.len()).collect::<Vec<_>>(), frames.iter().map(|f| f.index).collect::<Vec<_>>());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_symbolicate_with_linker_keeps_module() {
        let modules = ModuleResolver::system();
        let address = test_symbolicate_with_linker_keeps_module as usize;
        let frames = symbolicate_with_linker(&[address, 0], &modules);

        assert_eq!(2, frames.len());
        assert_eq!(address, frames[0].program_counter);
        assert!(!frames[0].module.is_empty());
        assert_eq!(None, frames[0].file);
        assert_eq!(" [1] <-- (0x0)", frames[1].to_string());
    }

    #[test]
    fn test_frame_addresses_are_bounded() {
        let mut frames = FrameAddresses::new();
        for i in 0..MAX_FRAMES + 5 {
            frames.push(i + 1);
        }

        assert_eq!(MAX_FRAMES, frames.as_slice().len());
    }
}
