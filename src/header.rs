//! ヘッダの書式化
//!
//! ヘッダの書式は`$(名前)`形式のマクロを含む文字列で、以下のマクロを置換する。
//!
//! - `$(yyyy)` `$(yy)`: 年
//! - `$(MM)` `$(M)`: 月
//! - `$(dd)` `$(d)`: 日
//! - `$(hh)` `$(h)`: 時
//! - `$(mm)` `$(m)`: 分
//! - `$(ss)` `$(s)`: 秒
//! - `$(ttt)` `$(t)`: ミリ秒
//! - `$(V)` `$(v)`: レベルの名前と数値
//! - `$(MODULE)` `$(module)`: モジュールのフルパスとファイル名
//! - `$(function)` `$(srcfile)` `$(line)`: 関数名、ソースファイル、行番号
//! - `$(PID)` `$(TID)`: プロセスIDとスレッドID
//!
//! 未知のマクロはそのまま出力する。置換した文字列に含まれるマクロは、再度置換しない。
//!
//! 分単位でしか変わらないマクロ（日時、モジュール名、プロセスID）は、`HeaderCache`に
//! 置換済みの状態で保持し、呼び出しごとに変わるマクロだけを置換する。

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use time::{Date, OffsetDateTime};

use crate::verbosity::Verbosity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    YearLong,
    YearShort,
    MonthPadded,
    Month,
    DayPadded,
    Day,
    HourPadded,
    Hour,
    MinutePadded,
    Minute,
    SecondPadded,
    Second,
    MillisPadded,
    Millis,
    VerbosityName,
    VerbosityBits,
    ModuleFull,
    ModuleShort,
    Function,
    SourceFile,
    Line,
    ProcessId,
    ThreadId,
}

impl Token {
    fn parse(name: &str) -> Option<Token> {
        let token = match name {
            "yyyy" => Token::YearLong,
            "yy" => Token::YearShort,
            "MM" => Token::MonthPadded,
            "M" => Token::Month,
            "dd" => Token::DayPadded,
            "d" => Token::Day,
            "hh" => Token::HourPadded,
            "h" => Token::Hour,
            "mm" => Token::MinutePadded,
            "m" => Token::Minute,
            "ss" => Token::SecondPadded,
            "s" => Token::Second,
            "ttt" => Token::MillisPadded,
            "t" => Token::Millis,
            "V" => Token::VerbosityName,
            "v" => Token::VerbosityBits,
            "MODULE" => Token::ModuleFull,
            "module" => Token::ModuleShort,
            "function" => Token::Function,
            "srcfile" => Token::SourceFile,
            "line" => Token::Line,
            "PID" => Token::ProcessId,
            "TID" => Token::ThreadId,
            _ => return None,
        };
        Some(token)
    }

    fn source(self) -> &'static str {
        match self {
            Token::YearLong => "$(yyyy)",
            Token::YearShort => "$(yy)",
            Token::MonthPadded => "$(MM)",
            Token::Month => "$(M)",
            Token::DayPadded => "$(dd)",
            Token::Day => "$(d)",
            Token::HourPadded => "$(hh)",
            Token::Hour => "$(h)",
            Token::MinutePadded => "$(mm)",
            Token::Minute => "$(m)",
            Token::SecondPadded => "$(ss)",
            Token::Second => "$(s)",
            Token::MillisPadded => "$(ttt)",
            Token::Millis => "$(t)",
            Token::VerbosityName => "$(V)",
            Token::VerbosityBits => "$(v)",
            Token::ModuleFull => "$(MODULE)",
            Token::ModuleShort => "$(module)",
            Token::Function => "$(function)",
            Token::SourceFile => "$(srcfile)",
            Token::Line => "$(line)",
            Token::ProcessId => "$(PID)",
            Token::ThreadId => "$(TID)",
        }
    }

    /// 分単位でしか変わらないマクロか確認する。
    fn is_slow(self) -> bool {
        matches!(
            self,
            Token::YearLong
                | Token::YearShort
                | Token::MonthPadded
                | Token::Month
                | Token::DayPadded
                | Token::Day
                | Token::HourPadded
                | Token::Hour
                | Token::MinutePadded
                | Token::Minute
                | Token::ModuleFull
                | Token::ModuleShort
                | Token::ProcessId
        )
    }

    /// 置換する文字列を返却する。`None`の場合はマクロをそのまま出力する。
    fn value<'a>(self, ctx: &HeaderContext<'a>) -> Option<Cow<'a, str>> {
        let ts = &ctx.timestamp;
        let value = match self {
            Token::YearLong => format!("{:04}", ts.year()).into(),
            Token::YearShort => format!("{:02}", ts.year().rem_euclid(100)).into(),
            Token::MonthPadded => format!("{:02}", ts.month() as u8).into(),
            Token::Month => (ts.month() as u8).to_string().into(),
            Token::DayPadded => format!("{:02}", ts.day()).into(),
            Token::Day => ts.day().to_string().into(),
            Token::HourPadded => format!("{:02}", ts.hour()).into(),
            Token::Hour => ts.hour().to_string().into(),
            Token::MinutePadded => format!("{:02}", ts.minute()).into(),
            Token::Minute => ts.minute().to_string().into(),
            Token::SecondPadded => format!("{:02}", ts.second()).into(),
            Token::Second => ts.second().to_string().into(),
            Token::MillisPadded => format!("{:03}", ts.millisecond()).into(),
            Token::Millis => ts.millisecond().to_string().into(),
            Token::VerbosityName => Cow::Borrowed(ctx.verbosity.name()),
            Token::VerbosityBits => ctx.verbosity.bits().to_string().into(),
            Token::ModuleFull => non_empty(ctx.module_name)?,
            Token::ModuleShort => non_empty(short_module_name(ctx.module_name))?,
            Token::Function => non_empty(ctx.function)?,
            Token::SourceFile => non_empty(ctx.source_file)?,
            Token::Line => ctx.line.to_string().into(),
            Token::ProcessId => ctx.process_id.to_string().into(),
            Token::ThreadId => ctx.thread_id.to_string().into(),
        };
        Some(value)
    }
}

fn non_empty(s: &str) -> Option<Cow<'_, str>> {
    (!s.is_empty()).then_some(Cow::Borrowed(s))
}

/// モジュールのフルパスからファイル名を取り出す。
pub fn short_module_name(module_name: &str) -> &str {
    match module_name.rfind(['/', '\\']) {
        Some(pos) => &module_name[pos + 1..],
        None => module_name,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(Token),
}

/// 書式を先頭から1度だけ走査して、文字列とマクロに分割する。
fn compile(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("$(") {
        literal.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let token = after
            .find(')')
            .and_then(|end| Token::parse(&after[..end]).map(|t| (t, end)));

        match token {
            Some((token, end)) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Token(token));
                rest = &after[end + 1..];
            }
            None => {
                // 未知のマクロは`$(`だけを文字列として扱い、続きを走査する。
                literal.push_str("$(");
                rest = after;
            }
        }
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn push_literal(out: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Literal(last)) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Segment::Literal(text.to_string()));
    }
}

/// 分単位のマクロを置換して、呼び出しごとに変わるマクロだけを残す。
fn render_slow(segments: &[Segment], ctx: &HeaderContext<'_>) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());

    for segment in segments {
        match segment {
            Segment::Literal(text) => push_literal(&mut out, text),
            Segment::Token(token) if token.is_slow() => {
                let value = token.value(ctx);
                push_literal(&mut out, value.as_deref().unwrap_or(token.source()));
            }
            Segment::Token(token) => out.push(Segment::Token(*token)),
        }
    }
    out
}

fn render_fast(segments: &[Segment], ctx: &HeaderContext<'_>) -> String {
    let mut out = String::with_capacity(ctx.template.len() + 32);

    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Token(token) => match token.value(ctx) {
                Some(value) => out.push_str(&value),
                None => out.push_str(token.source()),
            },
        }
    }
    out
}

/// ヘッダを作成するための、呼び出しごとの情報
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext<'a> {
    pub template: &'a str,
    /// 設定のレベル（マスク）
    pub global_verbosity: Verbosity,
    /// レコードのレベル
    pub verbosity: Verbosity,
    pub timestamp: OffsetDateTime,
    pub thread_id: u64,
    pub process_id: u32,
    pub source_file: &'a str,
    pub line: u32,
    pub function: &'a str,
    pub module_name: &'a str,
}

/// キャッシュを使わずにヘッダを作成する。
pub fn render_uncached(ctx: &HeaderContext<'_>) -> String {
    render_fast(&render_slow(&compile(ctx.template), ctx), ctx)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct SlowKey {
    template: String,
    global_verbosity: Verbosity,
    date: Date,
    hour: u8,
    minute: u8,
    process_id: u32,
    module_name: String,
}

impl SlowKey {
    fn new(ctx: &HeaderContext<'_>) -> Self {
        Self {
            template: ctx.template.to_string(),
            global_verbosity: ctx.global_verbosity,
            date: ctx.timestamp.date(),
            hour: ctx.timestamp.hour(),
            minute: ctx.timestamp.minute(),
            process_id: ctx.process_id,
            module_name: ctx.module_name.to_string(),
        }
    }

    fn matches(&self, ctx: &HeaderContext<'_>) -> bool {
        self.minute == ctx.timestamp.minute()
            && self.hour == ctx.timestamp.hour()
            && self.date == ctx.timestamp.date()
            && self.process_id == ctx.process_id
            && self.global_verbosity == ctx.global_verbosity
            && self.module_name == ctx.module_name
            && self.template == ctx.template
    }
}

#[derive(Default)]
struct Slot {
    key: Option<SlowKey>,
    partial: Vec<Segment>,
}

/// 分単位のマクロを置換済みのヘッダを保持するキャッシュ
///
/// キャッシュは1つだけで、`render`の間はロックを保持する。
#[derive(Default)]
pub struct HeaderCache {
    slot: Mutex<Slot>,
    slow_renders: AtomicU64,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// ヘッダを作成する。
    ///
    /// 書式、設定のレベル、時刻（分）、プロセスID、モジュール名のいずれかが前回の呼び出しと
    /// 異なる場合だけ、分単位のマクロを置換し直す。
    ///
    /// # 引数
    ///
    /// * ctx: ヘッダを作成するための情報。
    ///
    /// # 戻り値
    ///
    /// ヘッダ文字列。
    pub fn render(&self, ctx: &HeaderContext<'_>) -> String {
        self.render_locked(&mut self.slot.lock(), ctx)
    }

    /// ロックを獲得できない場合は、キャッシュを使わずにヘッダを作成する。
    ///
    /// クラッシュ時に、ロックを保持したまま停止したスレッドを待たないために使用する。
    pub fn render_or_bypass(&self, ctx: &HeaderContext<'_>) -> String {
        match self.slot.try_lock() {
            Some(mut slot) => self.render_locked(&mut slot, ctx),
            None => render_uncached(ctx),
        }
    }

    fn render_locked(&self, slot: &mut Slot, ctx: &HeaderContext<'_>) -> String {
        let hit = slot.key.as_ref().is_some_and(|key| key.matches(ctx));
        if !hit {
            slot.partial = render_slow(&compile(ctx.template), ctx);
            slot.key = Some(SlowKey::new(ctx));
            self.slow_renders.fetch_add(1, Ordering::Relaxed);
        }

        render_fast(&slot.partial, ctx)
    }

    /// 分単位のマクロを置換した回数
    pub fn slow_renders(&self) -> u64 {
        self.slow_renders.load(Ordering::Relaxed)
    }
}
