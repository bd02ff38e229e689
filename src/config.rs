//! Switchyard configuration: deserialization and validation.
//!
//! The gateway consumes a static list of server descriptors and routing rules,
//! loaded once at startup. Every tuning knob has a default so a minimal file
//! only needs `[[servers]]` and `[[rules]]` entries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::router::rules::RuleCondition;
use crate::supervisor::readiness::ReadinessProbe;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a descriptor's environment map to concrete values.
///
/// `${VAR}` references are looked up in the gateway's own environment (unset
/// variables resolve to the empty string); any other value is passed through
/// as a literal.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level gateway configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Capacity of the observability event queue.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Immutable description of one backend tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_category")]
    pub category: String,
    /// Higher is preferred.
    #[serde(default)]
    pub priority: i32,
    pub transport: TransportKind,
    // process fields
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    // network fields
    pub url: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    /// Per-server override of `pool.max_connections`.
    pub max_connections: Option<usize>,
    /// Regexes matched against process output to detect readiness.
    /// Absent means the built-in pattern; an empty list means grace period only.
    pub ready_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub health: HealthCheckConfig,
}

/// Supported backend transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process spawned and supervised by the gateway.
    Process,
    /// External endpoint; never spawned or restarted.
    Network,
}

/// Per-server health-check settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Liveness check cadence for this server; defaults to the supervisor's interval.
    pub interval_ms: Option<u64>,
    /// Grace period after launch before a silent server is considered running.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive crashes restarted immediately before backoff applies.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: None,
            timeout_ms: default_health_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Routing rule as written in config; compiled into a `RoutingRule` at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Literal substring, or a regex when `regex = true`.
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    pub target: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
}

impl RuleConfig {
    /// Substring rule with no conditions.
    pub fn literal(pattern: &str, target: &str, priority: i32) -> Self {
        Self {
            pattern: pattern.to_string(),
            regex: false,
            target: target.to_string(),
            priority,
            conditions: vec![],
        }
    }

    /// Regex rule with no conditions.
    pub fn regex(pattern: &str, target: &str, priority: i32) -> Self {
        Self {
            regex: true,
            ..Self::literal(pattern, target, priority)
        }
    }
}

/// Connection pool tuning, shared by every server pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub min_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
    #[serde(default = "default_max_connection_age_ms")]
    pub max_connection_age_ms: u64,
    #[serde(default = "default_max_waiting_requests")]
    pub max_waiting_requests: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
            max_connection_age_ms: default_max_connection_age_ms(),
            max_waiting_requests: default_max_waiting_requests(),
            sweep_interval_ms: default_sweep_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_millis(self.max_connection_age_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Process supervisor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: default_health_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_health_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_connections() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_max_idle_time_ms() -> u64 {
    300_000
}

fn default_max_connection_age_ms() -> u64 {
    3_600_000
}

fn default_max_waiting_requests() -> usize {
    100
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_health_interval_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl GatewayConfig {
    /// Parse a TOML document into a config. Does not validate.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Configuration("config".to_string(), e.to_string()))
    }

    /// Read and parse a TOML config file. Does not validate.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Configuration(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    /// Enabled descriptors in configured order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Validate the config, failing fast on misconfigurations before any servers are spawned.
    pub fn validate(&self) -> crate::Result<()> {
        // 1. Ids are unique across all descriptors, enabled or not
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for server in &self.servers {
            if !seen_ids.insert(server.id.as_str()) {
                return Err(GatewayError::Configuration(
                    server.id.clone(),
                    "duplicate server id".to_string(),
                ));
            }
        }

        // 2. Validate each enabled descriptor
        for server in self.enabled_servers() {
            server.validate()?;
        }

        // 3. Rules must target an enabled server and compile
        let enabled: HashSet<&str> = self.enabled_servers().map(|s| s.id.as_str()).collect();
        for rule in &self.rules {
            if !enabled.contains(rule.target.as_str()) {
                return Err(GatewayError::Configuration(
                    rule.pattern.clone(),
                    format!("rule targets unknown server '{}'", rule.target),
                ));
            }
            crate::router::rules::RoutingRule::compile(rule)?;
        }

        // 4. Pool bounds
        if self.pool.max_connections == 0 {
            return Err(GatewayError::Configuration(
                "pool".to_string(),
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(GatewayError::Configuration(
                "pool".to_string(),
                "min_connections must not exceed max_connections".to_string(),
            ));
        }

        // 5. Periodic tasks need a non-zero period
        if self.pool.sweep_interval_ms == 0 {
            return Err(GatewayError::Configuration(
                "pool".to_string(),
                "sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.supervisor.health_interval_ms == 0 {
            return Err(GatewayError::Configuration(
                "supervisor".to_string(),
                "health_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerDescriptor {
    /// Effective pool bound for this server.
    pub fn max_connections(&self, pool: &PoolConfig) -> usize {
        self.max_connections.unwrap_or(pool.max_connections)
    }

    fn validate(&self) -> crate::Result<()> {
        let id = &self.id;

        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(GatewayError::Configuration(
                id.clone(),
                "server id must be non-empty with no whitespace".to_string(),
            ));
        }

        match self.transport {
            TransportKind::Process => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(GatewayError::Configuration(
                        id.clone(),
                        "process transport requires 'command' field".to_string(),
                    ));
                }
                if self.url.is_some() {
                    return Err(GatewayError::Configuration(
                        id.clone(),
                        "process transport should not have 'url' field".to_string(),
                    ));
                }
            }
            TransportKind::Network => {
                if self.url.is_none() {
                    return Err(GatewayError::Configuration(
                        id.clone(),
                        "network transport requires 'url' field".to_string(),
                    ));
                }
                if self.command.is_some() {
                    return Err(GatewayError::Configuration(
                        id.clone(),
                        "network transport should not have 'command' field".to_string(),
                    ));
                }
            }
        }

        if self.max_connections == Some(0) {
            return Err(GatewayError::Configuration(
                id.clone(),
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.health.interval_ms == Some(0) {
            return Err(GatewayError::Configuration(
                id.clone(),
                "health.interval_ms must be at least 1".to_string(),
            ));
        }

        // A value that starts like a reference must be a complete one
        for (key, value) in &self.env {
            if value.starts_with("${") && parse_env_ref(value).is_none_or(str::is_empty) {
                return Err(GatewayError::Configuration(
                    id.clone(),
                    format!("env value for key '{}' is a malformed ${{VAR}} reference: '{}'", key, value),
                ));
            }
        }

        ReadinessProbe::from_patterns(id, self.ready_patterns.as_deref())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> GatewayConfig {
        GatewayConfig::from_toml_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
        assert_eq!(parse_env_ref("${"), None);
    }

    #[test]
    fn test_resolve_env_vars_refs_and_literals() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("SWITCHYARD_TEST_VAR", "resolved_value") };
        let mut env = HashMap::new();
        env.insert("REF".to_string(), "${SWITCHYARD_TEST_VAR}".to_string());
        env.insert("LIT".to_string(), "plain".to_string());
        let resolved = resolve_env_vars(&env);
        assert_eq!(resolved.get("REF").unwrap(), "resolved_value");
        assert_eq!(resolved.get("LIT").unwrap(), "plain");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("SWITCHYARD_TEST_VAR") };
    }

    #[test]
    fn test_valid_full_config() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "git"
            category = "vcs"
            priority = 10
            transport = "process"
            command = "git-mcp"
            args = ["--stdio"]
            max_connections = 2

            [servers.health]
            timeout_ms = 500

            [[servers]]
            id = "bq"
            transport = "network"
            url = "http://localhost:8080/mcp"
            auth_required = true

            [[rules]]
            pattern = "^git\\."
            regex = true
            target = "git"
            priority = 10

            [[rules]]
            pattern = "bigquery"
            target = "bq"
            conditions = [{ kind = "requires_auth", value = true }]

            [pool]
            acquire_timeout_ms = 100
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.servers[0].max_connections(&config.pool), 2);
        assert_eq!(config.servers[1].max_connections(&config.pool), 10);
        assert_eq!(config.servers[0].health.ready_grace(), Duration::from_millis(500));
        assert_eq!(config.pool.acquire_timeout(), Duration::from_millis(100));
        assert_eq!(config.servers[1].category, "general");
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_duplicate_id_fails() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "same"
            transport = "process"
            command = "a"

            [[servers]]
            id = "same"
            transport = "process"
            command = "b"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(GatewayError::Configuration(id, msg)) if id == "same" && msg.contains("duplicate"))
        );
    }

    #[test]
    fn test_process_missing_command() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "git"
            transport = "process"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(GatewayError::Configuration(id, msg)) if id == "git" && msg.contains("command"))
        );
    }

    #[test]
    fn test_network_missing_url() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "api"
            transport = "network"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(GatewayError::Configuration(id, msg)) if id == "api" && msg.contains("url"))
        );
    }

    #[test]
    fn test_disabled_server_skips_validation() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "broken"
            transport = "process"
            enabled = false
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rule_with_unknown_target_rejected() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "git"
            transport = "process"
            command = "git-mcp"

            [[rules]]
            pattern = "fetch."
            target = "missing"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(GatewayError::Configuration(_, msg)) if msg.contains("unknown server 'missing'"))
        );
    }

    #[test]
    fn test_rule_with_bad_regex_rejected() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "git"
            transport = "process"
            command = "git-mcp"

            [[rules]]
            pattern = "^(git"
            regex = true
            target = "git"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Configuration(pattern, _)) if pattern == "^(git"
        ));
    }

    #[test]
    fn test_misspelled_condition_kind_rejected_at_parse() {
        let result = GatewayConfig::from_toml_str(
            r#"
            [[rules]]
            pattern = "git"
            target = "git"
            conditions = [{ kind = "min_priorty", value = 3 }]
            "#,
        );
        assert!(matches!(result, Err(GatewayError::Configuration(_, _))));
    }

    #[test]
    fn test_unknown_rule_field_rejected_at_parse() {
        let result = GatewayConfig::from_toml_str(
            r#"
            [[rules]]
            pattern = "git"
            target = "git"
            min_priority = 3
            "#,
        );
        assert!(matches!(result, Err(GatewayError::Configuration(_, _))));
    }

    #[test]
    fn test_malformed_env_ref_rejected() {
        let config = parse_toml(
            r#"
            [[servers]]
            id = "git"
            transport = "process"
            command = "git-mcp"
            env = { TOKEN = "${GITHUB_TOKEN" }
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Configuration(id, msg)) if id == "git" && msg.contains("TOKEN")
        ));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = parse_toml(
            r#"
            [pool]
            max_connections = 2
            min_connections = 3
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Configuration(section, _)) if section == "pool"
        ));
    }

    #[test]
    fn test_zero_periods_rejected() {
        let sweep = parse_toml("[pool]\nsweep_interval_ms = 0\n");
        assert!(matches!(
            sweep.validate(),
            Err(GatewayError::Configuration(section, msg))
                if section == "pool" && msg.contains("sweep_interval_ms")
        ));

        let health = parse_toml("[supervisor]\nhealth_interval_ms = 0\n");
        assert!(matches!(
            health.validate(),
            Err(GatewayError::Configuration(section, _)) if section == "supervisor"
        ));

        let per_server = parse_toml(
            r#"
            [[servers]]
            id = "git"
            transport = "process"
            command = "git-mcp"

            [servers.health]
            interval_ms = 0
            "#,
        );
        assert!(matches!(
            per_server.validate(),
            Err(GatewayError::Configuration(id, msg)) if id == "git" && msg.contains("interval_ms")
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(
            &path,
            r#"
            [[servers]]
            id = "fetch"
            transport = "network"
            url = "http://127.0.0.1:9000/mcp"
            "#,
        )
        .unwrap();
        let config = GatewayConfig::load(&path).await.unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].transport, TransportKind::Network);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = GatewayConfig::load(Path::new("/nonexistent/switchyard.toml")).await;
        assert!(matches!(result, Err(GatewayError::Configuration(_, _))));
    }
}
