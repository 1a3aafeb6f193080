use crate::stmb::lorebook::OrderMode;
use crate::stmb::paths::StmbPaths;
use crate::stmb::profile::{BUILTIN_PRESETS, ConnectionProfile, DEFAULT_TITLE_FORMAT, FixedConnection};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_LOREBOOK_NAME_TEMPLATE: &str = "LTM - {{char}} - {{chat}}";
pub const MAX_BUFFER: u64 = 50;
pub const MAX_PREVIOUS_MEMORIES: u64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub token_warning_threshold: u64,
    pub default_memory_count: u64,
    pub allow_scene_overlap: bool,
    pub show_memory_previews: bool,
    pub title_format: String,
    /// Response budget sent with every request; 0 leaves it to the provider.
    pub max_tokens: u64,
    pub convert_existing_recursion: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_warning_threshold: 50_000,
            default_memory_count: 0,
            allow_scene_overlap: false,
            show_memory_previews: false,
            title_format: DEFAULT_TITLE_FORMAT.to_string(),
            max_tokens: 0,
            convert_existing_recursion: false,
        }
    }
}

impl MemoryConfig {
    pub fn max_tokens(&self) -> Option<u64> {
        (self.max_tokens > 0).then_some(self.max_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSummaryConfig {
    pub enabled: bool,
    pub interval: u64,
    pub buffer: u64,
    pub manual_mode_enabled: bool,
    pub auto_create_lorebook: bool,
    pub lorebook_name_template: String,
}

impl Default for AutoSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 50,
            buffer: 2,
            manual_mode_enabled: false,
            auto_create_lorebook: false,
            lorebook_name_template: DEFAULT_LOREBOOK_NAME_TEMPLATE.to_string(),
        }
    }
}

impl AutoSummaryConfig {
    pub fn clamped_buffer(&self) -> u64 {
        self.buffer.min(MAX_BUFFER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcConfig {
    pub max_items_per_pass: u64,
    pub max_passes: u64,
    pub min_assigned: u64,
    pub token_target: u64,
    pub order_mode: OrderMode,
    pub order_value: i64,
    pub reverse_start: i64,
    pub disable_originals: bool,
    /// Custom analysis prompt; the built-in one is used when unset.
    pub prompt: Option<String>,
}

impl Default for ArcConfig {
    fn default() -> Self {
        Self {
            max_items_per_pass: 12,
            max_passes: 10,
            min_assigned: 2,
            token_target: 50_000,
            order_mode: OrderMode::Auto,
            order_value: 100,
            reverse_start: 9999,
            disable_originals: false,
            prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidePromptConfig {
    pub max_concurrent: u64,
}

impl Default for SidePromptConfig {
    fn default() -> Self {
        Self { max_concurrent: 2 }
    }
}

impl SidePromptConfig {
    pub fn wave_size(&self) -> usize {
        self.max_concurrent.clamp(1, 5) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u64,
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 3000,
        }
    }
}

/// The host's live model settings plus provider endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub active: FixedConnection,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            active: FixedConnection::default(),
            openai_base_url: "https://api.openai.com".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmbConfig {
    pub memory: MemoryConfig,
    pub auto_summary: AutoSummaryConfig,
    pub arcs: ArcConfig,
    pub side_prompts: SidePromptConfig,
    pub retry: RetryConfig,
    pub host: HostConfig,
    pub profiles: Vec<ConnectionProfile>,
    pub default_profile: usize,
}

impl Default for StmbConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            auto_summary: AutoSummaryConfig::default(),
            arcs: ArcConfig::default(),
            side_prompts: SidePromptConfig::default(),
            retry: RetryConfig::default(),
            host: HostConfig::default(),
            profiles: vec![ConnectionProfile::default()],
            default_profile: 0,
        }
    }
}

impl StmbConfig {
    /// Profile at `index`, falling back to the default profile.
    pub fn profile(&self, index: Option<usize>) -> &ConnectionProfile {
        index
            .and_then(|i| self.profiles.get(i))
            .or_else(|| self.profiles.get(self.default_profile))
            .or_else(|| self.profiles.first())
            .unwrap_or(&FALLBACK_PROFILE)
    }

    /// Case-insensitive profile lookup by name.
    pub fn profile_index_by_name(&self, name: &str) -> Option<usize> {
        let wanted = name.trim();
        self.profiles
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(wanted))
    }
}

static FALLBACK_PROFILE: std::sync::LazyLock<ConnectionProfile> =
    std::sync::LazyLock::new(ConnectionProfile::default);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStmbConfig {
    memory: Option<MemoryConfig>,
    auto_summary: Option<AutoSummaryConfig>,
    arcs: Option<ArcConfig>,
    side_prompts: Option<SidePromptConfig>,
    retry: Option<RetryConfig>,
    host: Option<HostConfig>,
    profiles: Option<Vec<ConnectionProfile>>,
    default_profile: Option<usize>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_optional(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

pub fn validate(cfg: &StmbConfig) -> Result<()> {
    if cfg.auto_summary.interval == 0 {
        return Err(anyhow!("invalid auto-summary interval: must be >= 1"));
    }
    if cfg.memory.default_memory_count > MAX_PREVIOUS_MEMORIES {
        return Err(anyhow!(
            "invalid default memory count: must be between 0 and {MAX_PREVIOUS_MEMORIES}"
        ));
    }
    if cfg.arcs.max_items_per_pass == 0 || cfg.arcs.max_passes == 0 || cfg.arcs.min_assigned == 0 {
        return Err(anyhow!(
            "invalid arc options: max items per pass, max passes and min assigned must be >= 1"
        ));
    }
    if cfg.arcs.token_target < 1000 {
        return Err(anyhow!("invalid arc token target: must be >= 1000"));
    }
    if cfg.profiles.is_empty() {
        return Err(anyhow!("at least one connection profile is required"));
    }
    if cfg.default_profile >= cfg.profiles.len() {
        return Err(anyhow!(
            "invalid default profile {}: only {} profile(s) configured",
            cfg.default_profile,
            cfg.profiles.len()
        ));
    }
    if cfg.memory.title_format.trim().is_empty() {
        return Err(anyhow!("invalid title format: cannot be empty"));
    }
    for profile in &cfg.profiles {
        if let Some(preset) = profile.preset.as_deref()
            && !BUILTIN_PRESETS.contains(&preset.trim().to_ascii_lowercase().as_str())
        {
            tracing::warn!(profile = %profile.name, preset, "unknown preset; the default prompt will be used");
        }
    }
    if cfg.auto_summary.lorebook_name_template.trim().is_empty() {
        return Err(anyhow!("invalid lorebook name template: cannot be empty"));
    }
    Ok(())
}

fn resolve_config_path(paths: &StmbPaths) -> PathBuf {
    if let Ok(custom) = env::var("STMB_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    paths.stmb_home.join("stmb.toml")
}

fn merge_file_config(base: &mut StmbConfig, paths: &StmbPaths) -> Result<()> {
    let path = resolve_config_path(paths);
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: PartialStmbConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse stmb config {}: {err}", path.display()))?;
    if let Some(memory) = parsed.memory {
        base.memory = memory;
    }
    if let Some(auto_summary) = parsed.auto_summary {
        base.auto_summary = auto_summary;
    }
    if let Some(arcs) = parsed.arcs {
        base.arcs = arcs;
    }
    if let Some(side_prompts) = parsed.side_prompts {
        base.side_prompts = side_prompts;
    }
    if let Some(retry) = parsed.retry {
        base.retry = retry;
    }
    if let Some(host) = parsed.host {
        base.host = host;
    }
    if let Some(profiles) = parsed.profiles {
        base.profiles = profiles;
    }
    if let Some(default_profile) = parsed.default_profile {
        base.default_profile = default_profile;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut StmbConfig) {
    cfg.memory.token_warning_threshold = env_or_u64(
        "STMB_TOKEN_WARNING_THRESHOLD",
        cfg.memory.token_warning_threshold,
    );
    cfg.memory.default_memory_count =
        env_or_u64("STMB_DEFAULT_MEMORY_COUNT", cfg.memory.default_memory_count);
    cfg.memory.allow_scene_overlap =
        env_or_bool("STMB_ALLOW_SCENE_OVERLAP", cfg.memory.allow_scene_overlap);
    cfg.memory.show_memory_previews =
        env_or_bool("STMB_SHOW_MEMORY_PREVIEWS", cfg.memory.show_memory_previews);
    cfg.memory.title_format = env_or_string("STMB_TITLE_FORMAT", &cfg.memory.title_format);
    cfg.memory.max_tokens = env_or_u64("STMB_MAX_TOKENS", cfg.memory.max_tokens);

    cfg.auto_summary.enabled = env_or_bool("STMB_AUTO_SUMMARY_ENABLED", cfg.auto_summary.enabled);
    cfg.auto_summary.interval =
        env_or_u64("STMB_AUTO_SUMMARY_INTERVAL", cfg.auto_summary.interval);
    cfg.auto_summary.buffer = env_or_u64("STMB_AUTO_SUMMARY_BUFFER", cfg.auto_summary.buffer);
    cfg.auto_summary.manual_mode_enabled =
        env_or_bool("STMB_MANUAL_MODE", cfg.auto_summary.manual_mode_enabled);
    cfg.auto_summary.auto_create_lorebook = env_or_bool(
        "STMB_AUTO_CREATE_LOREBOOK",
        cfg.auto_summary.auto_create_lorebook,
    );
    cfg.auto_summary.lorebook_name_template = env_or_string(
        "STMB_LOREBOOK_NAME_TEMPLATE",
        &cfg.auto_summary.lorebook_name_template,
    );

    cfg.arcs.max_items_per_pass = env_or_u64("STMB_ARC_MAX_ITEMS_PER_PASS", cfg.arcs.max_items_per_pass);
    cfg.arcs.max_passes = env_or_u64("STMB_ARC_MAX_PASSES", cfg.arcs.max_passes);
    cfg.arcs.disable_originals =
        env_or_bool("STMB_ARC_DISABLE_ORIGINALS", cfg.arcs.disable_originals);
    if let Some(mode) = OrderMode::parse(&env_or_string("STMB_ARC_ORDER_MODE", "")) {
        cfg.arcs.order_mode = mode;
    }

    cfg.side_prompts.max_concurrent =
        env_or_u64("STMB_SIDE_PROMPT_MAX_CONCURRENT", cfg.side_prompts.max_concurrent);

    cfg.retry.max_retries = env_or_u64("STMB_MAX_RETRIES", cfg.retry.max_retries);
    cfg.retry.retry_delay_ms = env_or_u64("STMB_RETRY_DELAY_MS", cfg.retry.retry_delay_ms);

    let active = &mut cfg.host.active;
    active.api = env_or_string("STMB_ACTIVE_API", &active.api);
    active.model = env_or_string("STMB_ACTIVE_MODEL", &active.model);
    active.temperature = env_or_f64("STMB_ACTIVE_TEMPERATURE", active.temperature);
    active.endpoint = env_optional("STMB_ACTIVE_ENDPOINT", active.endpoint.take());
    active.api_key = env_optional("STMB_ACTIVE_API_KEY", active.api_key.take());
    cfg.host.openai_base_url = env_or_string("OPENAI_BASE_URL", &cfg.host.openai_base_url);
    cfg.host.anthropic_base_url =
        env_or_string("ANTHROPIC_BASE_URL", &cfg.host.anthropic_base_url);
    cfg.host.openai_api_key = env_optional("OPENAI_API_KEY", cfg.host.openai_api_key.take());
    cfg.host.anthropic_api_key =
        env_optional("ANTHROPIC_API_KEY", cfg.host.anthropic_api_key.take());
}

/// Normalize the values that are clamped rather than rejected.
fn clamp_values(cfg: &mut StmbConfig) {
    cfg.auto_summary.buffer = cfg.auto_summary.clamped_buffer();
    cfg.arcs.order_value = cfg.arcs.order_value.clamp(0, 9999);
    cfg.arcs.reverse_start = cfg.arcs.reverse_start.clamp(100, 9999);
    cfg.profiles = std::mem::take(&mut cfg.profiles)
        .into_iter()
        .map(ConnectionProfile::normalized)
        .collect();
}

pub fn load_config(paths: &StmbPaths) -> Result<StmbConfig> {
    let mut cfg = StmbConfig::default();
    merge_file_config(&mut cfg, paths)?;
    apply_env_overrides(&mut cfg);
    clamp_values(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmb::profile::ConnectionSpec;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StmbConfig::default();
        assert_eq!(cfg.memory.token_warning_threshold, 50_000);
        assert_eq!(cfg.auto_summary.interval, 50);
        assert_eq!(cfg.auto_summary.buffer, 2);
        assert_eq!(cfg.auto_summary.lorebook_name_template, "LTM - {{char}} - {{chat}}");
        assert_eq!(cfg.arcs.order_mode, OrderMode::Auto);
        assert_eq!(cfg.arcs.reverse_start, 9999);
        assert_eq!(cfg.side_prompts.wave_size(), 2);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.retry_delay_ms, 3000);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn partial_toml_replaces_only_named_sections() {
        let raw = r#"
            default_profile = 1

            [auto_summary]
            enabled = true
            interval = 20

            [[profiles]]
            name = "Host"

            [[profiles]]
            name = "Fixed"
            preset = "minimal"
            connection = { kind = "fixed", model = "gpt-4o-mini" }
        "#;
        let parsed: PartialStmbConfig = toml::from_str(raw).expect("toml");
        assert!(parsed.memory.is_none());
        let auto = parsed.auto_summary.expect("auto summary");
        assert!(auto.enabled);
        assert_eq!(auto.interval, 20);
        assert_eq!(auto.buffer, 2);
        let profiles = parsed.profiles.expect("profiles");
        assert_eq!(profiles.len(), 2);
        assert!(matches!(profiles[1].connection, ConnectionSpec::Fixed(_)));
    }

    #[test]
    fn validate_rejects_bad_options() {
        let mut cfg = StmbConfig::default();
        cfg.arcs.token_target = 10;
        assert!(validate(&cfg).is_err());

        let mut cfg = StmbConfig::default();
        cfg.default_profile = 3;
        assert!(validate(&cfg).is_err());

        let mut cfg = StmbConfig::default();
        cfg.memory.default_memory_count = 8;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn clamp_values_bounds_buffer_and_arc_order() {
        let mut cfg = StmbConfig::default();
        cfg.auto_summary.buffer = 90;
        cfg.arcs.reverse_start = 12;
        cfg.arcs.order_value = 20_000;
        clamp_values(&mut cfg);
        assert_eq!(cfg.auto_summary.buffer, 50);
        assert_eq!(cfg.arcs.reverse_start, 100);
        assert_eq!(cfg.arcs.order_value, 9999);
    }

    #[test]
    fn profile_lookup_falls_back_to_default() {
        let mut cfg = StmbConfig::default();
        cfg.profiles.push(ConnectionProfile {
            name: "Second".to_string(),
            ..ConnectionProfile::default()
        });
        cfg.default_profile = 1;
        assert_eq!(cfg.profile(None).name, "Second");
        assert_eq!(cfg.profile(Some(0)).name, "Current Host Settings");
        assert_eq!(cfg.profile(Some(9)).name, "Second");
        assert_eq!(cfg.profile_index_by_name("second"), Some(1));
    }
}
