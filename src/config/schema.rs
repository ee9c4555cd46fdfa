use crate::queue::MessageCategory;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level courier configuration, loaded from `config.toml`.
///
/// Resolution order: `COURIER_CONFIG_DIR` env → `COURIER_WORKSPACE` env → `~/.courier/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Queue storage and worker pool (`[queue]`).
    pub queue: QueueConfig,
    /// Transports and inbox layout (`[delivery]`).
    pub delivery: DeliveryConfig,
    /// Retry and dead-letter policy (`[retry]`).
    pub retry: RetryConfig,
    /// Duplicate suppression (`[dedup]`).
    pub dedup: DedupConfig,
    /// Per-recipient rate limit (`[throttle]`).
    pub throttle: ThrottleConfig,
    /// Stuck-entry scanning (`[health]`).
    pub health: HealthConfig,
    /// Append-only transition journal (`[journal]`).
    pub journal: JournalConfig,
    /// Per-category formatting and transport overrides (`[router]`).
    pub router: RouterConfig,
    /// Known recipients (`[[agents]]`). Messages to anyone else are rejected.
    pub agents: Vec<AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let courier_dir = home.join(".courier");

        Self {
            workspace_dir: courier_dir.join("workspace"),
            config_path: courier_dir.join("config.toml"),
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            throttle: ThrottleConfig::default(),
            health: HealthConfig::default(),
            journal: JournalConfig::default(),
            router: RouterConfig::default(),
            agents: Vec::new(),
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────

/// Queue store configuration (`[queue]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueueConfig {
    /// SQLite database path, relative to the workspace unless absolute. Default: `"queue/queue.db"`.
    #[serde(default = "default_queue_db_path")]
    pub db_path: String,
    /// Number of concurrent delivery workers in the daemon. Default: `2`.
    #[serde(default = "default_queue_workers")]
    pub workers: usize,
    /// Idle poll interval for workers when no entry is due. Default: `500`.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_queue_db_path() -> String {
    "queue/queue.db".into()
}

fn default_queue_workers() -> usize {
    2
}

fn default_queue_poll_interval_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: default_queue_db_path(),
            workers: default_queue_workers(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

/// Delivery transport identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Live input surface of the recipient process.
    Injection,
    /// File drop into the recipient's inbox directory.
    Inbox,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Injection => "injection",
            Self::Inbox => "inbox",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery configuration (`[delivery]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryConfig {
    /// Root of per-agent inboxes (`<root>/<agent>/inbox`). Default: `<workspace>/agents`.
    #[serde(default)]
    pub inbox_root: Option<String>,
    /// Timeout for one inbox write. Default: `5000`.
    #[serde(default = "default_inbox_timeout_ms")]
    pub inbox_timeout_ms: u64,
    /// Enable the injection transport for agents with known coordinates. Default: `false`.
    #[serde(default)]
    pub injection_enabled: bool,
    /// Argv of the injection helper. `{recipient}`, `{x}` and `{y}` are
    /// substituted; the formatted message is written to its stdin.
    #[serde(default)]
    pub injection_command: Vec<String>,
    /// Timeout for one injection attempt. Default: `10000`.
    #[serde(default = "default_injection_timeout_ms")]
    pub injection_timeout_ms: u64,
    /// Also write the inbox file after a successful injection. Default: `true`.
    #[serde(default = "default_true")]
    pub audit_copy: bool,
}

fn default_inbox_timeout_ms() -> u64 {
    5_000
}

fn default_injection_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            inbox_root: None,
            inbox_timeout_ms: default_inbox_timeout_ms(),
            injection_enabled: false,
            injection_command: Vec::new(),
            injection_timeout_ms: default_injection_timeout_ms(),
            audit_copy: true,
        }
    }
}

// ── Retry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    Exponential,
}

/// Retry policy (`[retry]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    /// Completed attempts before an entry is dead-lettered. Default: `3`.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Back-off strategy: `"fixed"` or `"exponential"`. Default: `"fixed"`.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Base back-off delay. Default: `2000`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for exponential back-off. Default: `60000`.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            backoff: BackoffStrategy::Fixed,
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

// ── Dedup ────────────────────────────────────────────────────────

/// Duplicate suppression (`[dedup]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DedupConfig {
    /// Enable fingerprint checks on submission. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Retention window for delivered fingerprints. Default: `86400` (24h).
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,
    /// Maximum retained fingerprints; soonest-to-expire are evicted. Default: `10000`.
    #[serde(default = "default_dedup_max_keys")]
    pub max_keys: usize,
    /// Interval of the daemon's expired-key sweep. Default: `300`.
    #[serde(default = "default_dedup_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_dedup_window_secs() -> u64 {
    86_400
}

fn default_dedup_max_keys() -> usize {
    10_000
}

fn default_dedup_sweep_interval_secs() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_dedup_window_secs(),
            max_keys: default_dedup_max_keys(),
            sweep_interval_secs: default_dedup_sweep_interval_secs(),
        }
    }
}

// ── Throttle ─────────────────────────────────────────────────────

/// Per-recipient sliding-window limit (`[throttle]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThrottleConfig {
    /// Enable throttling. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Messages allowed per recipient within the window. Default: `5`.
    #[serde(default = "default_throttle_max_messages")]
    pub max_messages: usize,
    /// Window length. Default: `60`.
    #[serde(default = "default_throttle_window_secs")]
    pub window_secs: u64,
}

fn default_throttle_max_messages() -> usize {
    5
}

fn default_throttle_window_secs() -> u64 {
    60
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: default_throttle_max_messages(),
            window_secs: default_throttle_window_secs(),
        }
    }
}

// ── Health ───────────────────────────────────────────────────────

/// Health monitor (`[health]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthConfig {
    /// Interval between scans in the daemon. Default: `30`.
    #[serde(default = "default_health_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// `processing` entries older than this are reported stuck. Default: `300`.
    #[serde(default = "default_health_stuck_after_secs")]
    pub stuck_after_secs: u64,
    /// `pending` entries older than this are reported aged. Default: `900`.
    #[serde(default = "default_health_pending_max_age_secs")]
    pub pending_max_age_secs: u64,
    /// Snapshot file written after every scan, relative to the workspace. Default: `"queue/health.json"`.
    #[serde(default = "default_health_snapshot_path")]
    pub snapshot_path: String,
}

fn default_health_scan_interval_secs() -> u64 {
    30
}

fn default_health_stuck_after_secs() -> u64 {
    300
}

fn default_health_pending_max_age_secs() -> u64 {
    900
}

fn default_health_snapshot_path() -> String {
    "queue/health.json".into()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_health_scan_interval_secs(),
            stuck_after_secs: default_health_stuck_after_secs(),
            pending_max_age_secs: default_health_pending_max_age_secs(),
            snapshot_path: default_health_snapshot_path(),
        }
    }
}

// ── Journal ──────────────────────────────────────────────────────

/// Queue transition journal (`[journal]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JournalConfig {
    /// Append one JSON line per transition. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Journal path, relative to the workspace unless absolute. Default: `"queue/journal.jsonl"`.
    #[serde(default = "default_journal_path")]
    pub path: String,
    /// Keep only the newest N lines; `0` keeps everything. Default: `0`.
    #[serde(default)]
    pub max_entries: usize,
}

fn default_journal_path() -> String {
    "queue/journal.jsonl".into()
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_journal_path(),
            max_entries: 0,
        }
    }
}

// ── Router ───────────────────────────────────────────────────────

/// Category policy overrides (`[router.categories.<category>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RouterConfig {
    /// Keyed by category (`agent_to_agent`, `captain_to_agent`, `system_to_agent`, `external_to_agent`).
    #[serde(default)]
    pub categories: BTreeMap<String, CategoryPolicyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CategoryPolicyConfig {
    /// Header template. Placeholders: `{sender}`, `{recipient}`, `{category}`,
    /// `{priority}`, `{message_id}`, `{created_at}`.
    #[serde(default)]
    pub header: Option<String>,
    /// Preferred transport for this category.
    #[serde(default)]
    pub prefer: Option<TransportKind>,
}

// ── Agents ───────────────────────────────────────────────────────

/// Screen position of an agent's live input surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

/// One registered recipient (`[[agents]]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Unique agent name; also the inbox directory name.
    pub name: String,
    /// Inbox directory override. Default: `<inbox_root>/<name>/inbox`.
    #[serde(default)]
    pub inbox_dir: Option<String>,
    /// Known input surface; enables injection for this agent.
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    /// Disabled agents are treated as unknown recipients. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbox_dir: None,
            coordinates: None,
            enabled: true,
        }
    }
}

/// Directory-safe agent name: ASCII alphanumerics, `-`, `_` and `.`, not
/// starting with `.`.
pub fn is_valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".courier"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigResolutionSource {
    EnvConfigDir,
    EnvWorkspace,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::EnvConfigDir => "COURIER_CONFIG_DIR",
            Self::EnvWorkspace => "COURIER_WORKSPACE",
            Self::DefaultConfigDir => "default",
        }
    }
}

/// `(config_dir, workspace_dir, source)` by env precedence.
fn resolve_runtime_config_dirs() -> Result<(PathBuf, PathBuf, ConfigResolutionSource)> {
    if let Ok(custom_config_dir) = std::env::var("COURIER_CONFIG_DIR") {
        let custom_config_dir = custom_config_dir.trim();
        if !custom_config_dir.is_empty() {
            let config_dir = PathBuf::from(custom_config_dir);
            return Ok((
                config_dir.clone(),
                config_dir.join("workspace"),
                ConfigResolutionSource::EnvConfigDir,
            ));
        }
    }

    if let Ok(custom_workspace) = std::env::var("COURIER_WORKSPACE") {
        if !custom_workspace.trim().is_empty() {
            let workspace_dir = PathBuf::from(custom_workspace.trim());
            return Ok((
                workspace_dir.clone(),
                workspace_dir.join("workspace"),
                ConfigResolutionSource::EnvWorkspace,
            ));
        }
    }

    let config_dir = default_config_dir()?;
    Ok((
        config_dir.clone(),
        config_dir.join("workspace"),
        ConfigResolutionSource::DefaultConfigDir,
    ))
}

impl Config {
    /// Defaults rooted at `config_dir` instead of the home directory.
    pub fn for_dir(config_dir: &Path) -> Self {
        Self {
            workspace_dir: config_dir.join("workspace"),
            config_path: config_dir.join("config.toml"),
            ..Self::default()
        }
    }

    pub async fn load_or_init() -> Result<Self> {
        let (config_dir, workspace_dir, resolution_source) = resolve_runtime_config_dirs()?;
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path.clone();
            config.workspace_dir = workspace_dir;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source = resolution_source.as_str(),
            initialized,
            agents = config.agents.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Queue
        if self.queue.db_path.trim().is_empty() {
            anyhow::bail!("queue.db_path must not be empty");
        }
        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be greater than 0");
        }
        if self.queue.poll_interval_ms == 0 {
            anyhow::bail!("queue.poll_interval_ms must be greater than 0");
        }

        // Delivery
        if self.delivery.inbox_timeout_ms == 0 {
            anyhow::bail!("delivery.inbox_timeout_ms must be greater than 0");
        }
        if self.delivery.injection_timeout_ms == 0 {
            anyhow::bail!("delivery.injection_timeout_ms must be greater than 0");
        }
        if self.delivery.injection_enabled
            && self
                .delivery
                .injection_command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            anyhow::bail!("delivery.injection_command is required when injection_enabled = true");
        }

        // Retry
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
        }

        // Dedup / throttle
        if self.dedup.max_keys == 0 {
            anyhow::bail!("dedup.max_keys must be greater than 0");
        }
        if self.dedup.sweep_interval_secs == 0 {
            anyhow::bail!("dedup.sweep_interval_secs must be greater than 0");
        }
        if self.throttle.max_messages == 0 {
            anyhow::bail!("throttle.max_messages must be greater than 0");
        }
        if self.throttle.window_secs == 0 {
            anyhow::bail!("throttle.window_secs must be greater than 0");
        }

        // Health
        if self.health.scan_interval_secs == 0 {
            anyhow::bail!("health.scan_interval_secs must be greater than 0");
        }

        // Router
        for key in self.router.categories.keys() {
            if key.parse::<MessageCategory>().is_err() {
                anyhow::bail!("router.categories.{key} is not a known message category");
            }
        }

        // Agents
        let mut seen = HashSet::new();
        for (i, agent) in self.agents.iter().enumerate() {
            let name = agent.name.trim();
            if name.is_empty() {
                anyhow::bail!("agents[{i}].name must not be empty");
            }
            if !is_valid_agent_name(name) {
                anyhow::bail!(
                    "agents[{i}].name is invalid ({name}); expected [A-Za-z0-9_.-]+ not starting with '.'"
                );
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                anyhow::bail!("agents[{i}].name duplicates another agent ({name})");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(workers) = std::env::var("COURIER_WORKERS") {
            if let Ok(workers) = workers.trim().parse::<usize>() {
                self.queue.workers = workers;
            }
        }

        if let Ok(root) = std::env::var("COURIER_INBOX_ROOT") {
            if !root.trim().is_empty() {
                self.delivery.inbox_root = Some(root.trim().to_string());
            }
        }

        if let Ok(attempts) = std::env::var("COURIER_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.trim().parse::<u32>() {
                self.retry.max_attempts = attempts;
            }
        }

        if let Ok(flag) = std::env::var("COURIER_INJECTION_ENABLED") {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.delivery.injection_enabled = true,
                "0" | "false" | "no" | "off" => self.delivery.injection_enabled = false,
                _ => {}
            }
        }
    }

    /// Expand `~` and anchor relative paths at the workspace.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(raw.trim()).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.workspace_dir.join(expanded)
        }
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.resolve_path(&self.queue.db_path)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.resolve_path(&self.journal.path)
    }

    pub fn health_snapshot_path(&self) -> PathBuf {
        self.resolve_path(&self.health.snapshot_path)
    }

    pub fn inbox_root(&self) -> PathBuf {
        match self.delivery.inbox_root.as_deref() {
            Some(root) if !root.trim().is_empty() => self.resolve_path(root),
            _ => self.workspace_dir.join("agents"),
        }
    }

    /// Inbox directory for `agent`.
    pub fn agent_inbox_dir(&self, agent: &AgentConfig) -> PathBuf {
        match agent.inbox_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => self.resolve_path(dir),
            _ => self.inbox_root().join(agent.name.trim()).join("inbox"),
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;
        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
