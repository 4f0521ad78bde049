//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const LOCAL_CONFIG_BASENAME: &str = "staffetta";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_STORAGE_ROOT: &str = "objects";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MAX_OBJECT_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_MIN_OBJECT_BYTES: u64 = 1024;
const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 60;
const DEFAULT_DEPLOY_COOLDOWN_SECS: u64 = 60;
const DEFAULT_DEPLOY_TARGET: &str = "staffetta";

/// URL patterns (host + path prefix) the redirector consents to cache.
///
/// Entries are expanded by the policy layer into anchored regexes that
/// accept an optional `www.` prefix and exactly one trailing path segment
/// (the artifact filename).
const DEFAULT_ALLOWLIST: &[&str] = &[
    // Homebrew bottles
    "download.sf.net/project/machomebrew/Bottles",
    "homebrew.bintray.com/bottles",
    // Source tarball hosts
    "faculty.cse.tamu.edu/davis/SuiteSparse",
    "download.savannah.gnu.org/releases/libunwind",
    "github.com/[^/]+/[^/]+/archive",
    "github.com/[^/]+/[^/]+/releases/download/([^/]+)?",
    "api.github.com/repos/[^/]+/[^/]+/tarball",
    "gmplib.org/download/gmp",
    "mpfr.org/mpfr-current",
    "mpfr.org/mpfr-[\\d\\.]+",
    "nixos.org/releases/patchelf/patchelf-[\\d\\.]+",
    "kernel.org/pub/software/scm/git",
    "llvm.org/releases/[\\d\\.]+",
    "netlib.org/lapack",
    "fftw.org",
    // Sourceforge mirrors
    "sourceforge.net/projects/pcre/files/pcre/[^/]+",
    "downloads.sourceforge.net/sevenzip",
    "imagemagick.org/download/binaries",
    "tls.mbed.org/download",
    "cmake.org/files/v[0-9\\.]+",
];

/// Raw regexes rejected outright with 404.
const DEFAULT_DENYLIST: &[&str] = &["favicon\\.ico"];

/// Raw regexes forwarded to the origin without caching, even when an
/// allowlist entry would otherwise match (mutable repository indexes).
const DEFAULT_PASSLIST: &[&str] = &[".*/repomd\\.xml"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub storage: StorageSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub webhook: WebhookSettings,
    pub deploy: DeploySettings,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    /// Base URL under which stored objects are reachable by clients.
    /// Defaults to `http://{server.addr}/o/` when not configured.
    pub public_base_url: Url,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_object_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// How long a failed entry refuses new origin fetches.
    pub retry_cooldown: Duration,
    /// Bodies smaller than this are refused as suspected error pages.
    pub min_object_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Shared secret for signature verification; webhook surface is
    /// disabled entirely when absent.
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub cooldown: Duration,
    pub pull: Vec<String>,
    pub build: Vec<String>,
    pub targets: Vec<DeployTarget>,
}

/// One service replaced by a deploy run. The front door can be appended
/// here in configuration; by default only the cache service is restarted.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployTarget {
    pub name: String,
    pub stop: Vec<String>,
    pub start: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub pass: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STAFFETTA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Parse the CLI and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = <CliArgs as clap::Parser>::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    storage: RawStorageSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    webhook: RawWebhookSettings,
    deploy: RawDeploySettings,
    policy: RawPolicySettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    root: Option<PathBuf>,
    public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    connect_timeout_seconds: Option<u64>,
    request_timeout_seconds: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    max_object_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    retry_cooldown_seconds: Option<u64>,
    min_object_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWebhookSettings {
    secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDeploySettings {
    cooldown_seconds: Option<u64>,
    pull: Option<Vec<String>>,
    build: Option<Vec<String>>,
    targets: Option<Vec<DeployTarget>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    allow: Option<Vec<String>>,
    deny: Option<Vec<String>>,
    pass: Option<Vec<String>>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(root) = overrides.storage_root.as_ref() {
            self.storage.root = Some(root.clone());
        }
        if let Some(base) = overrides.storage_public_base_url.as_ref() {
            self.storage.public_base_url = Some(base.clone());
        }
        if let Some(secret) = overrides.webhook_secret.as_ref() {
            self.webhook.secret = Some(secret.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            storage,
            origin,
            cache,
            webhook,
            deploy,
            policy,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let storage = build_storage_settings(storage, &server)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache);
        let webhook = build_webhook_settings(webhook)?;
        let deploy = build_deploy_settings(deploy)?;
        let policy = build_policy_settings(policy);

        Ok(Self {
            server,
            logging,
            storage,
            origin,
            cache,
            webhook,
            deploy,
            policy,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|err| LoadError::invalid("server.addr", err.to_string()))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level.as_ref() {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_storage_settings(
    storage: RawStorageSettings,
    server: &ServerSettings,
) -> Result<StorageSettings, LoadError> {
    let root = storage
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));

    let public_base_url = match storage.public_base_url {
        Some(base) => Url::parse(&base)
            .map_err(|err| LoadError::invalid("storage.public_base_url", err.to_string()))?,
        None => {
            let derived = format!("http://{}/o/", server.addr);
            Url::parse(&derived)
                .map_err(|err| LoadError::invalid("storage.public_base_url", err.to_string()))?
        }
    };

    if public_base_url.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "storage.public_base_url",
            "URL cannot serve as a base",
        ));
    }

    Ok(StorageSettings {
        root,
        public_base_url,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let max_attempts = origin.max_attempts.unwrap_or(DEFAULT_FETCH_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(LoadError::invalid(
            "origin.max_attempts",
            "at least one attempt is required",
        ));
    }

    Ok(OriginSettings {
        connect_timeout: Duration::from_secs(
            origin
                .connect_timeout_seconds
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        ),
        request_timeout: Duration::from_secs(
            origin
                .request_timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
        max_attempts,
        backoff_base: Duration::from_millis(
            origin
                .backoff_base_ms
                .unwrap_or(DEFAULT_FETCH_BACKOFF_BASE_MS),
        ),
        max_object_bytes: origin.max_object_bytes.unwrap_or(DEFAULT_MAX_OBJECT_BYTES),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> CacheSettings {
    CacheSettings {
        retry_cooldown: Duration::from_secs(
            cache
                .retry_cooldown_seconds
                .unwrap_or(DEFAULT_RETRY_COOLDOWN_SECS),
        ),
        min_object_bytes: cache.min_object_bytes.unwrap_or(DEFAULT_MIN_OBJECT_BYTES),
    }
}

fn build_webhook_settings(webhook: RawWebhookSettings) -> Result<WebhookSettings, LoadError> {
    if let Some(secret) = webhook.secret.as_ref()
        && secret.is_empty()
    {
        return Err(LoadError::invalid(
            "webhook.secret",
            "secret must not be empty",
        ));
    }
    Ok(WebhookSettings {
        secret: webhook.secret,
    })
}

fn build_deploy_settings(deploy: RawDeploySettings) -> Result<DeploySettings, LoadError> {
    let pull = deploy
        .pull
        .unwrap_or_else(|| vec_of(&["git", "pull", "--ff-only"]));
    let build = deploy
        .build
        .unwrap_or_else(|| vec_of(&["docker", "build", "-t", "staffetta:latest", "."]));
    let targets = deploy.targets.unwrap_or_else(|| {
        vec![DeployTarget {
            name: DEFAULT_DEPLOY_TARGET.to_string(),
            stop: vec_of(&["docker", "rm", "-f", DEFAULT_DEPLOY_TARGET]),
            start: vec_of(&[
                "docker",
                "run",
                "-d",
                "--name",
                DEFAULT_DEPLOY_TARGET,
                "staffetta:latest",
            ]),
        }]
    });

    if pull.is_empty() {
        return Err(LoadError::invalid(
            "deploy.pull",
            "command must not be empty",
        ));
    }
    if build.is_empty() {
        return Err(LoadError::invalid(
            "deploy.build",
            "command must not be empty",
        ));
    }
    for target in &targets {
        if target.name.is_empty() || target.stop.is_empty() || target.start.is_empty() {
            return Err(LoadError::invalid(
                "deploy.targets",
                "each target needs a name and non-empty stop/start commands",
            ));
        }
    }

    Ok(DeploySettings {
        cooldown: Duration::from_secs(
            deploy
                .cooldown_seconds
                .unwrap_or(DEFAULT_DEPLOY_COOLDOWN_SECS),
        ),
        pull,
        build,
        targets,
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> PolicySettings {
    PolicySettings {
        allow: policy
            .allow
            .unwrap_or_else(|| DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect()),
        deny: policy
            .deny
            .unwrap_or_else(|| DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect()),
        pass: policy
            .pass
            .unwrap_or_else(|| DEFAULT_PASSLIST.iter().map(|s| s.to_string()).collect()),
    }
}

fn vec_of(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
