//! Log filter selection, the rolling file sink and the crash-artifact panic hook.
//!
//! Subscriber assembly lives in the binary; this module only decides what to
//! build so the decisions can be unit tested.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tilescale";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

/// Pick the effective filter.
///
/// Priority: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// default. The noise filter is prepended only when the user did not ask for
/// anything explicit on the command line.
pub fn compose_log_filter(options: &LoggingInitOptions) -> String {
    let explicit = options.cli_log_filter.is_some() || options.verbose > 0;
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    if !explicit && !options.noise_filter.trim().is_empty() {
        format!("{},{user_filter}", options.noise_filter)
    } else {
        user_filter
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Install a process-wide panic hook that writes a crash artifact under
/// `<data_dir>/logs/crash` and then chains to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        write_panic_artifact_with_fallback(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

fn write_panic_artifact_with_fallback(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into this hook.
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_panic_artifact_file(crash_dir, &build_panic_artifact_record(info))
    }));

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn build_panic_artifact_record(info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let backtrace = Backtrace::capture();
    let (backtrace_policy, backtrace_text) = match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to enable)".to_string(),
            "<disabled>".to_string(),
        ),
        _ => ("unsupported".to_string(), "<unavailable>".to_string()),
    };

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        source_location: info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string()),
        payload: panic_payload_to_string(info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    record: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:04}.log",
        record.timestamp.format("%Y%m%d-%H%M%S")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", record.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", record.thread_name)?;
    writeln!(file, "location={}", record.source_location)?;
    writeln!(file, "payload={}", record.payload)?;
    writeln!(file, "backtrace_policy={}", record.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", record.backtrace_text)?;
    file.flush()?;

    Ok(path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
