//! クラッシュの捕捉
//!
//! プロセスで1つのシグナルハンドラを登録する。ハンドラの状態は
//! `Uninstalled`、`Installed`、`Faulted`、`Terminal`の順に遷移する。
//!
//! シグナルを受け取ると、スタックのアドレスを収集して、登録された`CrashSink`に渡す。
//! その後、以前に登録されていたハンドラを呼び出すか、既定の処理に戻してプロセスを終了する。
//! 処理を再開することはない。

use std::any::Any;
use std::fmt;
use std::io;
use std::panic;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Once, Weak};

use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use time::{format_description, OffsetDateTime};

use crate::error::{Error, Result};
use crate::stacktrace::{self, StackFrame};

/// 捕捉するシグナル
pub const HANDLED_SIGNALS: [libc::c_int; 5] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

/// シグナルハンドラの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    Uninstalled = 0,
    Installed = 1,
    /// シグナルを処理中
    Faulted = 2,
    /// 処理を終えて、プロセスの終了を待っている
    Terminal = 3,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HandlerState::Installed,
            2 => HandlerState::Faulted,
            3 => HandlerState::Terminal,
            _ => HandlerState::Uninstalled,
        }
    }
}

/// 発生した障害
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultDescription {
    pub signal: i32,
    /// 不正なアクセスのアドレス
    pub fault_address: usize,
    /// 障害が発生した命令のアドレス
    pub program_counter: usize,
}

impl FaultDescription {
    pub fn signal_name(&self) -> &'static str {
        signal_name(self.signal)
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        _ => "UNKNOWN",
    }
}

/// 障害とパニックの記録先
pub trait CrashSink: Send + Sync {
    /// シグナルハンドラの中で呼び出される。
    ///
    /// # 引数
    ///
    /// * fault: 発生した障害。
    /// * addresses: 障害が発生したスレッドのフレームのアドレス。
    fn record_fault(&self, fault: &FaultDescription, addresses: &[usize]);

    /// パニックフックの中で呼び出される。
    fn record_panic(&self, message: &str, location: Option<(&str, u32)>);
}

/// 登録された記録先
///
/// 登録ごとに識別子を割り当て、最後に登録された生存中の記録先を使う。
pub(crate) struct TargetList {
    entries: RwLock<Vec<(u64, Weak<dyn CrashSink>)>>,
}

impl TargetList {
    const fn new() -> Self {
        Self {
            entries: const_rwlock(Vec::new()),
        }
    }

    fn register(&self, target: Weak<dyn CrashSink>) -> u64 {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, target));
        id
    }

    /// 登録を解除する。
    ///
    /// # 戻り値
    ///
    /// 登録が残っていない場合は`true`。
    fn unregister(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        entries.retain(|(entry, _)| *entry != id);
        entries.is_empty()
    }

    pub(crate) fn latest(&self) -> Option<Arc<dyn CrashSink>> {
        Self::latest_in(&self.entries.read())
    }

    /// ロックを獲得できない場合は`None`を返却する。
    fn try_latest(&self) -> Option<Arc<dyn CrashSink>> {
        Self::latest_in(&self.entries.try_read()?)
    }

    fn latest_in(entries: &[(u64, Weak<dyn CrashSink>)]) -> Option<Arc<dyn CrashSink>> {
        entries.iter().rev().find_map(|(_, target)| target.upgrade())
    }
}

static STATE: AtomicU8 = AtomicU8::new(HandlerState::Uninstalled as u8);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
pub(crate) static FAULT_TARGETS: TargetList = TargetList::new();
pub(crate) static PANIC_TARGETS: TargetList = TargetList::new();
/// 登録時に保存したハンドラ。空の場合はハンドラを登録していない。
static PREVIOUS: Mutex<Vec<(libc::c_int, libc::sigaction)>> = const_mutex(Vec::new());
static PANIC_HOOK: Once = Once::new();

/// 現在のシグナルハンドラの状態
pub fn state() -> HandlerState {
    HandlerState::from_u8(STATE.load(Ordering::Acquire))
}

/// 登録を解除するガード
///
/// 破棄すると自身の記録先だけを解除し、記録先が無くなった場合は以前のハンドラに戻す。
#[derive(Debug)]
#[must_use]
pub struct CrashGuard {
    id: u64,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        let mut previous = PREVIOUS.lock();
        if !FAULT_TARGETS.unregister(self.id) {
            return;
        }
        restore_previous(&mut previous);
        let _ = STATE.compare_exchange(
            HandlerState::Installed as u8,
            HandlerState::Uninstalled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// シグナルハンドラを登録する。
///
/// 既に登録されている場合は、記録先だけを追加する。
///
/// # 引数
///
/// * target: 障害の記録先。
///
/// # 戻り値
///
/// 登録を解除するガード。
pub fn install(target: Weak<dyn CrashSink>) -> Result<CrashGuard> {
    let mut previous = PREVIOUS.lock();
    let id = FAULT_TARGETS.register(target);

    if previous.is_empty() {
        for &signal in HANDLED_SIGNALS.iter() {
            match install_handler(signal) {
                Ok(old) => previous.push((signal, old)),
                Err(e) => {
                    FAULT_TARGETS.unregister(id);
                    restore_previous(&mut previous);
                    return Err(e);
                }
            }
        }
        STATE.store(HandlerState::Installed as u8, Ordering::Release);
    }

    Ok(CrashGuard { id })
}

fn install_handler(signal: libc::c_int) -> Result<libc::sigaction> {
    // SAFETY: sigactionはゼロ初期化できるCの構造体で、ハンドラはextern "C"関数。
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, &action, &mut old) != 0 {
            return Err(Error::HandlerInstall {
                signal,
                source: io::Error::last_os_error(),
            });
        }
        Ok(old)
    }
}

fn restore_previous(previous: &mut Vec<(libc::c_int, libc::sigaction)>) {
    for (signal, old) in previous.drain(..) {
        // SAFETY: 登録時に保存したハンドラに戻す。
        unsafe {
            libc::sigaction(signal, &old, std::ptr::null_mut());
        }
    }
}

/// シグナルの既定の処理に戻して、シグナルを送る。
///
/// シグナルはハンドラから戻った後に配送され、プロセスが終了する。
unsafe fn terminate_with_default(signal: libc::c_int) {
    libc::signal(signal, libc::SIG_DFL);
    libc::raise(signal);
}

extern "C" fn handle_fault(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let previous_state = STATE.swap(HandlerState::Faulted as u8, Ordering::AcqRel);
    if matches!(
        HandlerState::from_u8(previous_state),
        HandlerState::Faulted | HandlerState::Terminal
    ) {
        // 障害の処理中に発生した障害
        // SAFETY: 既定の処理に戻すだけ。
        unsafe { terminate_with_default(signal) };
        return;
    }

    let fault = FaultDescription {
        signal,
        fault_address: fault_address(info),
        program_counter: program_counter(context),
    };

    // SAFETY: 他のスレッドはスタックを走査していないとみなす。プロセスは直後に終了する。
    let addresses = unsafe { stacktrace::capture_addresses_unsynchronized() };

    if let Some(target) = FAULT_TARGETS.try_latest() {
        target.record_fault(&fault, addresses.as_slice());
    }

    STATE.store(HandlerState::Terminal as u8, Ordering::Release);
    // SAFETY: 保存したハンドラの種類に合わせて呼び出す。
    unsafe {
        chain_previous(signal, info, context);
        terminate_with_default(signal);
    }
}

/// 以前に登録されていたハンドラを呼び出す。
unsafe fn chain_previous(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let old = match PREVIOUS.try_lock() {
        Some(previous) => previous
            .iter()
            .find(|(s, _)| *s == signal)
            .map(|(_, old)| *old),
        None => None,
    };
    let old = match old {
        Some(old) => old,
        None => return,
    };

    let handler = old.sa_sigaction;
    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        return;
    }
    if old.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            std::mem::transmute(handler);
        f(signal, info, context);
    } else {
        let f: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
        f(signal);
    }
}

#[cfg(target_os = "linux")]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    // SAFETY: カーネルが渡したsiginfo_t。
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(target_os = "linux"))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        return 0;
    }
    // SAFETY: カーネルが渡したsiginfo_t。
    unsafe { (*info).si_addr as usize }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn program_counter(context: *mut libc::c_void) -> usize {
    if context.is_null() {
        return 0;
    }
    // SAFETY: SA_SIGINFOで登録したハンドラの第3引数はucontext_t。
    unsafe {
        let context = &*(context as *const libc::ucontext_t);
        context.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn program_counter(context: *mut libc::c_void) -> usize {
    if context.is_null() {
        return 0;
    }
    // SAFETY: SA_SIGINFOで登録したハンドラの第3引数はucontext_t。
    unsafe {
        let context = &*(context as *const libc::ucontext_t);
        context.uc_mcontext.pc as usize
    }
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
fn program_counter(_context: *mut libc::c_void) -> usize {
    0
}

/// パニックの記録先を登録する。
///
/// パニックフックはプロセスで1度だけ登録し、以前のフックは記録した後で呼び出す。
/// 記録先が無い間は、以前のフックだけを呼び出す。
///
/// # 引数
///
/// * target: パニックの記録先。
///
/// # 戻り値
///
/// 記録先の登録を解除するガード。
pub fn install_panic_hook(target: Weak<dyn CrashSink>) -> PanicGuard {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(target) = PANIC_TARGETS.latest() {
                let message = panic_message(info.payload());
                let location = info.location().map(|l| (l.file(), l.line()));
                target.record_panic(&message, location);
            }
            previous(info);
        }));
    });

    PanicGuard {
        id: PANIC_TARGETS.register(target),
    }
}

/// パニックの記録先の登録を解除するガード
#[derive(Debug)]
#[must_use]
pub struct PanicGuard {
    id: u64,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        PANIC_TARGETS.unregister(self.id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// クラッシュの報告を作成する。
///
/// # 引数
///
/// * fault: 発生した障害。
/// * frames: 解決したフレーム。
///
/// # 戻り値
///
/// `*** END STACKTRACE ***`で終わる複数行の文字列。
pub fn capture_report(fault: &FaultDescription, frames: &[StackFrame]) -> String {
    let mut report = format!(
        "*** Got signal {} ({}), faulty address {:#x}, from {:#x}\n*** STACKTRACE ***\n",
        fault.signal,
        fault.signal_name(),
        fault.fault_address,
        fault.program_counter
    );
    for frame in frames {
        report.push_str(&frame.to_string());
        report.push('\n');
    }
    report.push_str("*** END STACKTRACE ***");
    report
}

/// クラッシュのスナップショットファイルの名前を作成して、返却する。
///
/// ファイル名は、`{file_name}__<yyyy_mm_dd__hh_mm_ss>.crash`となる。
///
/// # 引数
///
/// - file_name: ログファイル名。
/// - now: クラッシュした日時。
///
/// # 戻り値
///
/// スナップショットファイル名。
pub fn create_snapshot_filename(file_name: &str, now: &OffsetDateTime) -> Result<String> {
    let format = format_description::parse("[year]_[month]_[day]__[hour]_[minute]_[second]")
        .map_err(|e| Error::TimeFormat(e.to_string()))?;
    let date = now
        .format(&format)
        .map_err(|e| Error::TimeFormat(e.to_string()))?;

    Ok(format!("{}__{}.crash", file_name, date))
}

impl fmt::Display for FaultDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signal {} ({}) at {:#x} from {:#x}",
            self.signal,
            self.signal_name(),
            self.fault_address,
            self.program_counter
        )
    }
}

/// プロセス全体の登録を変更するテストを直列に実行する。
#[cfg(test)]
pub(crate) static TEST_SERIAL: Mutex<()> = const_mutex(());

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use time::{format_description, OffsetDateTime};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        faults: AtomicUsize,
        panics: AtomicUsize,
    }

    impl CrashSink for Recorder {
        fn record_fault(&self, _fault: &FaultDescription, _addresses: &[usize]) {
            self.faults.fetch_add(1, Ordering::SeqCst);
        }

        fn record_panic(&self, _message: &str, _location: Option<(&str, u32)>) {
            self.panics.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn CrashSink> {
        let target: Arc<dyn CrashSink> = recorder.clone();
        Arc::downgrade(&target)
    }

    #[test]
    fn test_older_target_survives_newer_guard() {
        let _serial = TEST_SERIAL.lock();
        let older = Arc::new(Recorder::default());
        let newer = Arc::new(Recorder::default());
        let fault = FaultDescription {
            signal: libc::SIGSEGV,
            fault_address: 0,
            program_counter: 0,
        };

        let older_guard = install(weak(&older)).unwrap();
        let newer_guard = install(weak(&newer)).unwrap();
        FAULT_TARGETS.latest().unwrap().record_fault(&fault, &[]);
        assert_eq!(1, newer.faults.load(Ordering::SeqCst));

        drop(newer_guard);
        assert_eq!(HandlerState::Installed, state());
        FAULT_TARGETS.latest().unwrap().record_fault(&fault, &[]);
        assert_eq!(1, older.faults.load(Ordering::SeqCst));

        drop(older_guard);
        assert_eq!(HandlerState::Uninstalled, state());
        assert!(FAULT_TARGETS.latest().is_none());
    }

    #[test]
    fn test_panic_hook_is_shared_by_registrations() {
        let _serial = TEST_SERIAL.lock();
        let older = Arc::new(Recorder::default());
        let newer = Arc::new(Recorder::default());

        let _older_guard = install_panic_hook(weak(&older));
        let newer_guard = install_panic_hook(weak(&newer));
        drop(newer_guard);

        let result = thread::spawn(|| panic!("boom")).join();
        assert!(result.is_err());

        assert_eq!(1, older.panics.load(Ordering::SeqCst));
        assert_eq!(0, newer.panics.load(Ordering::SeqCst));
    }

    #[test]
    fn test_create_snapshot_filename() {
        let now = "20220526 15:25:32 +09:00:00";
        let format = format_description::parse(
            "[year][month][day] [hour]:[minute]:[second] [offset_hour \
                sign:mandatory]:[offset_minute]:[offset_second]",
        )
        .unwrap();
        let date = OffsetDateTime::parse(now, &format).unwrap();

        assert_eq!(
            "foo.log__2022_05_26__15_25_32.crash",
            create_snapshot_filename("foo.log", &date).unwrap()
        );
    }

    #[test]
    fn test_capture_report() {
        let fault = FaultDescription {
            signal: libc::SIGSEGV,
            fault_address: 0,
            program_counter: 0x1234,
        };
        let frames = vec![StackFrame {
            index: 0,
            program_counter: 0x1234,
            module: "/usr/bin/app".to_string(),
            ..StackFrame::default()
        }];

        let report = capture_report(&fault, &frames);
        let expected = format!(
            "*** Got signal {} (SIGSEGV), faulty address 0x0, from 0x1234\n\
             *** STACKTRACE ***\n \
             [0] <-- (0x1234) [Mod: /usr/bin/app]\n\
             *** END STACKTRACE ***",
            libc::SIGSEGV
        );

        assert_eq!(expected, report);
    }

    #[test]
    fn test_handler_state_round_trip() {
        for state in [
            HandlerState::Uninstalled,
            HandlerState::Installed,
            HandlerState::Faulted,
            HandlerState::Terminal,
        ] {
            assert_eq!(state, HandlerState::from_u8(state as u8));
        }
    }
}
