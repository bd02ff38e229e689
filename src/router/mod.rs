//! Request routing: map `(method, optional explicit server)` to one server id.
//!
//! Rules are kept sorted by descending priority (ties in insertion order) behind
//! a read-write lock, so rule mutation never interleaves with evaluation. Load
//! counters and round-robin cursors live behind their own mutex.

pub mod rules;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::{RuleConfig, ServerDescriptor};
use crate::error::GatewayError;
use crate::router::rules::{insert_sorted, RoutingRule, RuleSummary};
use crate::router::strategy::{classify, LoadState, Strategy};

/// Source of truth for whether a server can take traffic right now.
pub trait Availability: Send + Sync {
    fn is_available<'a>(&'a self, server_id: &'a str) -> BoxFuture<'a, bool>;
}

/// Outcome of a dry-run routing pass.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub method: String,
    pub strategy: Strategy,
    /// Rules whose pattern matched, before availability and condition filtering.
    pub matched_rules: usize,
    pub candidates: Vec<String>,
    pub selected: String,
}

/// Candidates surviving rule matching and filtering for one method.
struct Plan {
    strategy: Strategy,
    matched_rules: usize,
    candidates: Vec<ServerDescriptor>,
}

/// Picks a backend server for each request.
pub struct Router {
    /// Known servers by id.
    servers: HashMap<String, ServerDescriptor>,
    rules: RwLock<Vec<RoutingRule>>,
    load: Mutex<LoadState>,
    availability: Arc<dyn Availability>,
}

impl Router {
    /// Build a router over the configured servers and rules.
    ///
    /// Fails with `Configuration` if a rule does not compile or targets an
    /// unknown server.
    pub fn new(
        servers: &[ServerDescriptor],
        rules: &[RuleConfig],
        availability: Arc<dyn Availability>,
    ) -> crate::Result<Self> {
        let servers: HashMap<String, ServerDescriptor> = servers
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            check_target(&servers, rule)?;
            insert_sorted(&mut compiled, RoutingRule::compile(rule)?);
        }

        Ok(Self {
            servers,
            rules: RwLock::new(compiled),
            load: Mutex::new(LoadState::new()),
            availability,
        })
    }

    /// Route a request to exactly one server id.
    ///
    /// An explicit server bypasses rule matching entirely but must be known
    /// and available.
    pub async fn route(&self, method: &str, explicit: Option<&str>) -> crate::Result<String> {
        if let Some(server_id) = explicit {
            return self.check_explicit(server_id).await;
        }

        let plan = self.plan(method).await?;

        let selected = {
            let mut load = self.load.lock().await;
            let idx = load
                .select(plan.strategy, &plan.candidates)
                .ok_or_else(|| no_candidates(method))?;
            let id = plan.candidates[idx].id.clone();
            load.record(&id);
            id
        };

        tracing::debug!(
            method = %method,
            server = %selected,
            strategy = ?plan.strategy,
            candidates = plan.candidates.len(),
            "routed request"
        );
        Ok(selected)
    }

    /// Run rule matching, filtering and selection without touching counters or cursors.
    pub async fn test_routing(&self, method: &str) -> crate::Result<RoutingDecision> {
        let plan = self.plan(method).await?;
        let idx = {
            let load = self.load.lock().await;
            load.peek(plan.strategy, &plan.candidates)
                .ok_or_else(|| no_candidates(method))?
        };
        Ok(RoutingDecision {
            method: method.to_string(),
            strategy: plan.strategy,
            matched_rules: plan.matched_rules,
            selected: plan.candidates[idx].id.clone(),
            candidates: plan.candidates.into_iter().map(|c| c.id).collect(),
        })
    }

    /// Servers that could serve `method` right now, in candidate order.
    pub async fn available_servers(&self, method: &str) -> Vec<String> {
        match self.plan(method).await {
            Ok(plan) => plan.candidates.into_iter().map(|c| c.id).collect(),
            Err(_) => vec![],
        }
    }

    /// Add a rule, keeping the list priority-sorted.
    pub async fn add_rule(&self, rule: &RuleConfig) -> crate::Result<()> {
        check_target(&self.servers, rule)?;
        let compiled = RoutingRule::compile(rule)?;
        let mut rules = self.rules.write().await;
        insert_sorted(&mut rules, compiled);
        tracing::info!(pattern = %rule.pattern, target = %rule.target, "routing rule added");
        Ok(())
    }

    /// Remove every rule with this pattern text. Returns how many were removed.
    pub async fn remove_rule(&self, pattern: &str) -> usize {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.pattern.as_str() != pattern);
        let removed = before - rules.len();
        if removed > 0 {
            tracing::info!(pattern = %pattern, removed, "routing rule removed");
        }
        removed
    }

    /// Current rules in evaluation order.
    pub async fn rules(&self) -> Vec<RuleSummary> {
        self.rules.read().await.iter().map(RuleSummary::from).collect()
    }

    /// Snapshot of the per-server load counters.
    pub async fn load_counters(&self) -> HashMap<String, u64> {
        self.load.lock().await.counters()
    }

    async fn check_explicit(&self, server_id: &str) -> crate::Result<String> {
        if !self.servers.contains_key(server_id) {
            return Err(GatewayError::Unavailable(
                server_id.to_string(),
                "server is not configured".to_string(),
            ));
        }
        if !self.availability.is_available(server_id).await {
            return Err(GatewayError::Unavailable(
                server_id.to_string(),
                "server is not running".to_string(),
            ));
        }
        Ok(server_id.to_string())
    }

    /// Match, sort and filter rules for `method`.
    async fn plan(&self, method: &str) -> crate::Result<Plan> {
        // Rules are already priority-sorted; clone matches so the lock is not
        // held across availability checks.
        let matched: Vec<RoutingRule> = {
            let rules = self.rules.read().await;
            rules.iter().filter(|r| r.matches(method)).cloned().collect()
        };

        if matched.is_empty() {
            return Err(GatewayError::NotFound(method.to_string()));
        }

        let mut candidates: Vec<ServerDescriptor> = Vec::new();
        for rule in &matched {
            if candidates.iter().any(|c| c.id == rule.target) {
                continue;
            }
            let Some(server) = self.servers.get(&rule.target) else {
                continue;
            };
            if !rule.admits(server) {
                continue;
            }
            if !self.availability.is_available(&server.id).await {
                continue;
            }
            candidates.push(server.clone());
        }

        if candidates.is_empty() {
            return Err(no_candidates(method));
        }

        Ok(Plan {
            strategy: classify(method),
            matched_rules: matched.len(),
            candidates,
        })
    }
}

fn check_target(servers: &HashMap<String, ServerDescriptor>, rule: &RuleConfig) -> crate::Result<()> {
    if servers.contains_key(&rule.target) {
        Ok(())
    } else {
        Err(GatewayError::Configuration(
            rule.pattern.clone(),
            format!("rule targets unknown server '{}'", rule.target),
        ))
    }
}

fn no_candidates(method: &str) -> GatewayError {
    GatewayError::Unavailable(
        method.to_string(),
        "no available server satisfies the matching rules".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheckConfig, TransportKind};
    use crate::router::rules::RuleCondition;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Availability stub backed by a fixed set of live server ids.
    struct StaticAvailability(std::sync::Mutex<HashSet<String>>);

    impl StaticAvailability {
        fn new(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(
                ids.iter().map(|s| s.to_string()).collect(),
            )))
        }

        fn set_down(&self, id: &str) {
            self.0.lock().unwrap().remove(id);
        }
    }

    impl Availability for StaticAvailability {
        fn is_available<'a>(&'a self, server_id: &'a str) -> BoxFuture<'a, bool> {
            let up = self.0.lock().unwrap().contains(server_id);
            Box::pin(async move { up })
        }
    }

    fn server(id: &str, category: &str, priority: i32) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            enabled: true,
            category: category.to_string(),
            priority,
            transport: TransportKind::Network,
            command: None,
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            url: Some(format!("http://{id}/mcp")),
            auth_required: false,
            max_connections: None,
            ready_patterns: None,
            health: HealthCheckConfig::default(),
        }
    }

    fn router(rules: &[RuleConfig], live: &[&str]) -> (Router, Arc<StaticAvailability>) {
        let servers = vec![server("a", "vcs", 10), server("b", "vcs", 5)];
        let availability = StaticAvailability::new(live);
        let router = Router::new(&servers, rules, availability.clone()).unwrap();
        (router, availability)
    }

    #[tokio::test]
    async fn test_explicit_unknown_server_unavailable() {
        let (router, _) = router(&[], &["a", "b"]);
        let result = router.route("any.method", Some("z")).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(id, _)) if id == "z"));
    }

    #[tokio::test]
    async fn test_explicit_server_bypasses_rules() {
        let (router, _) = router(&[], &["a", "b"]);
        assert_eq!(router.route("no.rule.here", Some("b")).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_explicit_server_down_unavailable() {
        let (router, availability) = router(&[], &["a", "b"]);
        availability.set_down("b");
        assert!(matches!(
            router.route("x", Some("b")).await,
            Err(GatewayError::Unavailable(id, _)) if id == "b"
        ));
    }

    #[tokio::test]
    async fn test_no_matching_rule_not_found() {
        let (router, _) = router(&[RuleConfig::regex(r"^git\.", "a", 0)], &["a", "b"]);
        let result = router.route("unknown.op", None).await;
        assert!(matches!(result, Err(GatewayError::NotFound(m)) if m == "unknown.op"));
    }

    #[tokio::test]
    async fn test_matched_but_all_filtered_unavailable() {
        let (router, availability) = router(&[RuleConfig::regex(r"^git\.", "a", 0)], &["a", "b"]);
        availability.set_down("a");
        let result = router.route("git.status", None).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(m, _)) if m == "git.status"));
    }

    #[tokio::test]
    async fn test_conditions_filter_candidates() {
        let mut rule = RuleConfig::literal("git", "a", 5);
        rule.conditions = vec![RuleCondition::CategoryEquals("data".into())];
        let (router, _) = router(&[rule, RuleConfig::literal("git", "b", 1)], &["a", "b"]);
        assert_eq!(router.route("git.commit", None).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_round_robin_scenario() {
        let servers = vec![server("a", "web", 5), server("b", "web", 5)];
        let availability = StaticAvailability::new(&["a", "b"]);
        let rules = vec![
            RuleConfig::regex(r"^(search|fetch)\.", "a", 1),
            RuleConfig::regex(r"^(search|fetch)\.", "b", 1),
        ];
        let router = Router::new(&servers, &rules, availability).unwrap();
        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(router.route("search.x", None).await.unwrap());
        }
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_priority_strategy_prefers_higher_server_priority() {
        // b's rule has higher rule priority but a has the higher server priority
        let (router, _) = router(
            &[RuleConfig::literal("git", "a", 1), RuleConfig::literal("git", "b", 9)],
            &["a", "b"],
        );
        assert_eq!(router.route("git.commit", None).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_least_connections_spreads_load() {
        let (router, _) = router(
            &[RuleConfig::literal("bigquery", "a", 1), RuleConfig::literal("bigquery", "b", 1)],
            &["a", "b"],
        );
        let first = router.route("bigquery.query", None).await.unwrap();
        let second = router.route("bigquery.query", None).await.unwrap();
        assert_eq!(first, "a");
        assert_eq!(second, "b");
        let counters = router.load_counters().await;
        assert_eq!(counters["a"], 1);
        assert_eq!(counters["b"], 1);
    }

    #[tokio::test]
    async fn test_test_routing_is_side_effect_free() {
        let (router, _) = router(
            &[RuleConfig::literal("search", "a", 1), RuleConfig::literal("search", "b", 1)],
            &["a", "b"],
        );
        for _ in 0..3 {
            let decision = router.test_routing("search.web").await.unwrap();
            assert_eq!(decision.selected, "a");
            assert_eq!(decision.strategy, Strategy::RoundRobin);
            assert_eq!(decision.candidates, vec!["a", "b"]);
            assert_eq!(decision.matched_rules, 2);
        }
        assert!(router.load_counters().await.is_empty());
    }

    #[tokio::test]
    async fn test_available_servers_filters_down_servers() {
        let (router, availability) = router(
            &[RuleConfig::literal("git", "a", 1), RuleConfig::literal("git", "b", 1)],
            &["a", "b"],
        );
        availability.set_down("a");
        assert_eq!(router.available_servers("git.log").await, vec!["b"]);
        assert!(router.available_servers("nothing").await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove_rules() {
        let (router, _) = router(&[RuleConfig::literal("git", "a", 1)], &["a", "b"]);
        router.add_rule(&RuleConfig::literal("fetch", "b", 5)).await.unwrap();
        let rules = router.rules().await;
        assert_eq!(rules[0].pattern, "fetch");
        assert_eq!(rules[1].pattern, "git");

        assert_eq!(router.route("fetch.get", None).await.unwrap(), "b");
        assert_eq!(router.remove_rule("fetch").await, 1);
        assert!(matches!(
            router.route("fetch.get", None).await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(router.remove_rule("fetch").await, 0);
    }

    #[tokio::test]
    async fn test_add_rule_unknown_target_rejected() {
        let (router, _) = router(&[], &["a"]);
        let result = router.add_rule(&RuleConfig::literal("x", "ghost", 0)).await;
        assert!(matches!(result, Err(GatewayError::Configuration(_, msg)) if msg.contains("ghost")));
    }
}
