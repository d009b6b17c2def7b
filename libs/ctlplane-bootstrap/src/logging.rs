use crate::config::{LoggingConfig, Section};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

#[cfg(feature = "otel")]
pub type OtelLayer = tracing_opentelemetry::OpenTelemetryLayer<Registry, opentelemetry_sdk::trace::Tracer>;
#[cfg(not(feature = "otel"))]
pub type OtelLayer = ();

// The non-blocking stderr worker stops when its guard is dropped.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// `None` means the sink is switched off for that target.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

fn level_filter(s: &str) -> LevelFilter {
    parse_level(s).map_or(LevelFilter::OFF, LevelFilter::from_level)
}

/// `ctlplane` matches `ctlplane` and `ctlplane::db`, but not `ctlplane_bootstrap`.
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ---------------- rotating file writers ----------------

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct RotatingFile(SharedRotate);

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("log file lock poisoned"))?
            .flush()
    }
}

/// Writes to the file selected for the record's target; `None` discards.
struct RoutedFile(Option<RotatingFile>);

impl Write for RoutedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-target files; targets without their own file go to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotatingFile>,
    by_target: Vec<(String, RotatingFile)>,
}

impl FileRouter {
    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_target.is_empty()
    }

    fn select(&self, target: &str) -> Option<RotatingFile> {
        self.by_target
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = RoutedFile;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedFile(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedFile(self.select(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_rotating(section: &Section, base_dir: &Path) -> std::io::Result<Option<RotatingFile>> {
    if section.file.trim().is_empty() {
        return Ok(None);
    }

    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // MaxFiles wins over age-based retention when both are configured.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rotate = FileRotate::new(
        path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Ok(Some(RotatingFile(Arc::new(Mutex::new(rotate)))))
}

fn build_file_router(cfg: &LoggingConfig, base_dir: &Path) -> FileRouter {
    let mut router = FileRouter::default();

    for (name, section) in cfg {
        match open_rotating(section, base_dir) {
            Ok(Some(writer)) if name == DEFAULT_SECTION => router.default = Some(writer),
            Ok(Some(writer)) => router.by_target.push((name.clone(), writer)),
            Ok(None) => {}
            Err(e) => eprintln!(
                "Failed to open log file '{}' for '{name}': {e}",
                resolve_log_path(&section.file, base_dir).display()
            ),
        }
    }

    router
}

// ---------------- per-sink level targets ----------------

fn console_targets(cfg: &LoggingConfig) -> Targets {
    let default = cfg
        .get(DEFAULT_SECTION)
        .map_or(LevelFilter::INFO, |s| level_filter(&s.console_level));

    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .fold(Targets::new().with_default(default), |targets, (name, s)| {
            targets.with_target(name.clone(), level_filter(&s.console_level))
        })
}

fn file_targets(cfg: &LoggingConfig, has_default_file: bool) -> Targets {
    let default = match cfg.get(DEFAULT_SECTION) {
        Some(s) if has_default_file => level_filter(&s.file_level),
        _ => LevelFilter::OFF,
    };

    // A target only gets a file rule if it has its own file.
    cfg.iter()
        .filter(|(name, s)| name.as_str() != DEFAULT_SECTION && !s.file.trim().is_empty())
        .fold(Targets::new().with_default(default), |targets, (name, s)| {
            targets.with_target(name.clone(), level_filter(&s.file_level))
        })
}

// ---------------- public init ----------------

/// Install the global subscriber: OpenTelemetry layer (optional), `RUST_LOG` cap,
/// human console output on stderr and JSON files with rotation.
///
/// `base_dir` anchors relative log file paths, normally `server.home_dir`.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path, otel_layer: Option<OtelLayer>) {
    // Bridge `log` records from dependencies (sqlx, reqwest) into tracing.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal(otel_layer);
        return;
    }

    let router = build_file_router(cfg, base_dir);
    let console = console_targets(cfg);
    let files = file_targets(cfg, router.default.is_some());

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console.clone());

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(files)
    });

    // RUST_LOG, when set, caps every sink; YAML targets drive levels otherwise.
    let env = EnvFilter::try_from_default_env().ok();

    #[cfg(feature = "otel")]
    let registry = Registry::default().with(otel_layer.map(|otel| otel.with_filter(console)));
    #[cfg(not(feature = "otel"))]
    let registry = {
        let _ = (otel_layer, console);
        Registry::default()
    };

    let _ = registry
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

fn init_minimal(otel_layer: Option<OtelLayer>) {
    let env = EnvFilter::try_from_default_env().ok();
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    #[cfg(feature = "otel")]
    let registry = Registry::default().with(otel_layer);
    #[cfg(not(feature = "otel"))]
    let registry = {
        let _ = otel_layer;
        Registry::default()
    };

    let _ = registry.with(env).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_age_days: None,
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn parse_level_handles_off_and_unknown() {
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("off"), None);
        assert_eq!(parse_level("none"), None);
        assert_eq!(parse_level("chatty"), Some(Level::INFO));
    }

    #[test]
    fn target_prefix_respects_module_boundaries() {
        assert!(matches_target_prefix("ctlplane", "ctlplane"));
        assert!(matches_target_prefix("ctlplane::database", "ctlplane"));
        assert!(!matches_target_prefix("ctlplane_bootstrap", "ctlplane"));
        assert!(!matches_target_prefix("sqlx", "ctlplane"));
    }

    #[test]
    fn console_targets_use_default_and_overrides() {
        let mut cfg = default_logging_config();
        cfg.insert("sqlx".to_string(), section("warn", "", ""));

        let targets = console_targets(&cfg);
        assert!(targets.would_enable("ctlplane", &Level::INFO));
        assert!(!targets.would_enable("ctlplane", &Level::DEBUG));
        assert!(targets.would_enable("sqlx::query", &Level::WARN));
        assert!(!targets.would_enable("sqlx::query", &Level::INFO));
    }

    #[test]
    fn file_targets_are_off_without_default_file() {
        let mut cfg = LoggingConfig::new();
        cfg.insert(DEFAULT_SECTION.to_string(), section("info", "", "debug"));
        cfg.insert("ctlplane::ipam".to_string(), section("info", "ipam.log", "trace"));

        let targets = file_targets(&cfg, false);
        assert!(!targets.would_enable("ctlplane::database", &Level::ERROR));
        assert!(targets.would_enable("ctlplane::ipam", &Level::TRACE));
    }

    #[test]
    fn file_router_routes_by_target() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert(DEFAULT_SECTION.to_string(), section("info", "logs/all.log", "debug"));
        cfg.insert("ctlplane::ipam".to_string(), section("info", "logs/ipam.log", "debug"));

        let router = build_file_router(&cfg, tmp.path());
        assert!(!router.is_empty());
        assert!(router.default.is_some());
        assert_eq!(router.by_target.len(), 1);
        assert!(tmp.path().join("logs").exists());

        let ipam = router.select("ctlplane::ipam::client").unwrap();
        assert!(Arc::ptr_eq(&ipam.0, &router.by_target[0].1 .0));

        let other = router.select("ctlplane::database").unwrap();
        assert!(Arc::ptr_eq(&other.0, &router.default.as_ref().unwrap().0));
    }
}
