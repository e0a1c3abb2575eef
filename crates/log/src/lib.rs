//! Process-wide leveled logger with optional debug categories, a debug.log sink,
//! and an in-memory capture buffer for tests.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Debug categories that can be switched on individually (`-debug=bench,mempool`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Category {
    Bench = 1 << 0,
    Mempool = 1 << 1,
    MempoolRej = 1 << 2,
    Reindex = 1 << 3,
    Validation = 1 << 4,
    CoinDb = 1 << 5,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Bench,
        Category::Mempool,
        Category::MempoolRej,
        Category::Reindex,
        Category::Validation,
        Category::CoinDb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Bench => "bench",
            Category::Mempool => "mempool",
            Category::MempoolRej => "mempoolrej",
            Category::Reindex => "reindex",
            Category::Validation => "validation",
            Category::CoinDb => "coindb",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|cat| cat.as_str() == raw)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);
static LOG_CATEGORIES: AtomicU32 = AtomicU32::new(0);
static LOG_FILE: OnceLock<Mutex<Option<File>>> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

static LOG_CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static LOG_CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn enable_category(category: Category) {
    LOG_CATEGORIES.fetch_or(category as u32, Ordering::Relaxed);
}

pub fn category_enabled(category: Category) -> bool {
    LOG_CATEGORIES.load(Ordering::Relaxed) & category as u32 != 0
}

/// Appends log lines to `path` in addition to stderr.
pub fn open_log_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let slot = LOG_FILE.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(file);
    }
    Ok(())
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        LOG_CAPTURE_ENABLED.store(false, Ordering::Relaxed);
        return;
    }
    LOG_CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    LOG_CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    LOG_CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = LOG_CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

fn current_format() -> Format {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    }
}

fn render(level: Level, target: &str, file: &str, line: u32, msg: &str, now: std::time::Duration) -> String {
    match current_format() {
        Format::Text => {
            let mut out = String::with_capacity(msg.len() + 48);
            if LOG_TIMESTAMPS.load(Ordering::Relaxed) {
                let ts = Timestamp {
                    unix_seconds: now.as_secs(),
                    millis: now.subsec_millis(),
                };
                out.push_str(&ts.to_string());
                out.push(' ');
            }
            out.push_str(level.as_str());
            out.push(' ');
            out.push_str(target);
            out.push_str(": ");
            out.push_str(msg);
            out
        }
        Format::Json => json!({
            "ts_ms": now.as_millis() as u64,
            "level": level.as_str(),
            "target": target,
            "file": file,
            "line": line,
            "msg": msg,
        })
        .to_string(),
    }
}

pub fn log(level: Level, target: &'static str, file: &'static str, line: u32, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let msg = args.to_string();
    let rendered = render(level, target, file, line, &msg, now);

    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) {
        let _ = writeln!(io::stderr().lock(), "{rendered}");
    }
    if let Some(slot) = LOG_FILE.get() {
        if let Ok(mut guard) = slot.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{rendered}");
            }
        }
    }
    if LOG_CAPTURE_ENABLED.load(Ordering::Relaxed) {
        push_capture(CapturedLog {
            ts_ms: now.as_millis().try_into().unwrap_or(u64::MAX),
            level,
            target,
            msg,
        });
    }
}

fn push_capture(entry: CapturedLog) {
    let Some(buf) = LOG_CAPTURE.get() else {
        return;
    };
    let Ok(mut guard) = buf.lock() else {
        return;
    };
    let cap = LOG_CAPTURE_CAPACITY.load(Ordering::Relaxed).max(1);
    guard.push_back(entry);
    while guard.len() > cap {
        guard.pop_front();
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// Logs at info level when `category` was switched on, regardless of the level filter.
#[macro_export]
macro_rules! log_print {
    ($category:expr, $($arg:tt)*) => {{
        if $crate::category_enabled($category) {
            $crate::log($crate::Level::Info, $category.as_str(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.millis
        )
    }
}

/// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (y + i32::from(m <= 2), m, d)
}
