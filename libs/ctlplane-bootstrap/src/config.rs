use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::resolve_home_dir;

/// Main application configuration with strongly-typed sections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Core server configuration.
    pub server: ServerConfig,
    /// Persistence configuration (optional; the server falls back to the default SQLite file).
    pub database: Option<DatabaseConfig>,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Tracing configuration (optional, disabled if None).
    pub tracing: Option<TracingConfig>,
    /// Address management service (optional).
    pub ipam: Option<IpamConfig>,
    /// Feature flag overrides: flag name → enabled.
    #[serde(default)]
    pub fflags: HashMap<String, bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub home_dir: String, // will be normalized to absolute path
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// `postgres://…`, `sqlite://…` or `sqlite://@file(name.sqlite)` (resolved under home_dir).
    /// `${VAR}` references are expanded from the environment.
    pub dsn: String,
    #[serde(default)]
    pub pool: PoolCfg,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolCfg {
    pub max_conns: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IpamConfig {
    /// Base URL of the IPAM service, e.g. `http://127.0.0.1:9090`.
    pub url: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_ipam_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ipam_timeout_ms() -> u64 {
    5_000
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

/// Tracing configuration for OpenTelemetry distributed tracing
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub service_name: Option<String>,
    pub exporter: Option<Exporter>,
    pub sampler: Option<Sampler>,
    pub propagation: Option<Propagation>,
    pub resource: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Exporter {
    pub kind: Option<String>, // "otlp_grpc" | "otlp_http"
    pub endpoint: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sampler {
    pub strategy: Option<String>, // "parentbased_always_on" | "parentbased_ratio" | "always_on" | "always_off"
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Propagation {
    pub w3c_trace_context: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/api.log"
    #[serde(default)]
    pub file_level: String,
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Empty => $HOME/.ctlplane (or %APPDATA%/.ctlplane)
            home_dir: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite://@file(ctlplane.sqlite)?mode=rwc".to_string(),
            pool: PoolCfg::default(),
        }
    }
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/ctlplane.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: Some(DatabaseConfig::default()),
            logging: Some(default_logging_config()),
            tracing: None,
            ipam: None,
            fflags: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `server.home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            server: ServerConfig::default(),
            database: None,
            logging: None,
            tracing: None,
            ipam: None,
            fflags: HashMap::new(),
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            // APP__SERVER__PORT=8081 maps to server.port
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .context("Failed to extract config from figment")?;

        normalize_home_dir_inplace(&mut config.server)
            .context("Failed to resolve server.home_dir")?;

        Ok(config)
    }

    /// Load configuration from file or create with default values.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                normalize_home_dir_inplace(&mut c.server)
                    .context("Failed to resolve server.home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }

        if args.mock {
            self.database = Some(DatabaseConfig {
                dsn: "sqlite::memory:".to_string(),
                // in-memory SQLite is per-connection
                pool: PoolCfg {
                    max_conns: Some(1),
                    acquire_timeout: None,
                },
            });
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }

    /// Final DSN for the persistence handle: env expanded, SQLite `@file()` resolved.
    pub fn database_dsn(&self) -> Result<Option<String>> {
        let Some(db) = &self.database else {
            return Ok(None);
        };
        let expanded = expand_env_in_dsn(&db.dsn)?;
        let dsn = if expanded.starts_with("sqlite") {
            resolve_sqlite_dsn(&expanded, Path::new(&self.server.home_dir))?
        } else {
            expanded
        };
        validate_dsn(&dsn)?;
        Ok(Some(dsn))
    }
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub port: Option<u16>,
    pub print_config: bool,
    pub verbose: u8,
    pub mock: bool,
}

const DEFAULT_SUBDIR: &str = ".ctlplane";

fn normalize_home_dir_inplace(server: &mut ServerConfig) -> Result<()> {
    let opt = if server.home_dir.trim().is_empty() {
        None
    } else {
        Some(server.home_dir.clone())
    };

    let resolved: PathBuf = resolve_home_dir(opt, DEFAULT_SUBDIR, true)
        .context("home_dir normalization failed")?;

    server.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}

/// Replaces every `${VARNAME}` in a DSN with the environment value.
/// Fails if a referenced variable is missing.
pub fn expand_env_in_dsn(dsn: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    let mut result = dsn.to_string();
    for cap in re.captures_iter(dsn) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .with_context(|| format!("Environment variable '{var_name}' not found in DSN"))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

/// Validates that a server DSN is parseable. SQLite DSNs are passed through.
pub fn validate_dsn(dsn: &str) -> Result<()> {
    if dsn.starts_with("sqlite:") {
        return Ok(());
    }
    let scheme_ok = dsn
        .split_once("://")
        .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty());
    if !scheme_ok {
        anyhow::bail!("Invalid DSN '{dsn}': expected <driver>://<address>");
    }
    dsn::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid DSN '{dsn}': {e}"))?;
    Ok(())
}

/// Resolves `sqlite://@file(name)` to a file under `home_dir` (absolute paths kept).
/// Anything after the closing parenthesis, such as query parameters, is preserved.
fn resolve_sqlite_dsn(dsn: &str, home_dir: &Path) -> Result<String> {
    const MARKER: &str = "@file(";

    let Some(start) = dsn.find(MARKER) else {
        return Ok(dsn.to_string());
    };
    let rest = &dsn[start + MARKER.len()..];
    let end = rest
        .find(')')
        .ok_or_else(|| anyhow::anyhow!("Invalid @file() syntax in SQLite DSN: {dsn}"))?;
    let file = &rest[..end];

    let path = if Path::new(file).is_absolute() {
        PathBuf::from(file)
    } else {
        std::fs::create_dir_all(home_dir)
            .with_context(|| format!("Failed to create home directory: {home_dir:?}"))?;
        home_dir.join(file)
    };

    let normalized = path.to_string_lossy().replace('\\', "/");
    let is_windows_drive = normalized.len() > 1 && normalized.chars().nth(1) == Some(':');
    let base = if is_windows_drive {
        format!("sqlite:{normalized}")
    } else {
        format!("sqlite://{normalized}")
    };

    Ok(format!("{base}{}", &rest[end + 1..]))
}
