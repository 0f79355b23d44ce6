use std::collections::HashSet;
use std::time::Duration;

/// Engine tunables.
///
/// Defaults match production behavior; tests tighten the intervals. The
/// host service owns dynamic-config plumbing, so values here are plain
/// fields resolved at engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sub-deadline for acquiring the current-run lock during start.
    pub lock_acquire_timeout: Duration,
    /// Bounded retry count for conflict/stale-state loops.
    pub conditional_retry_count: usize,
    /// How long a long-poll waits for history progress before returning the
    /// latest snapshot.
    pub long_poll_expiration_interval: Duration,
    /// Base wait for the first decision task to complete before a query is
    /// rejected with `QueryBeforeFirstDecision`.
    pub query_first_decision_task_wait: Duration,
    /// Poll interval while waiting on the first decision task.
    pub query_first_decision_task_check_interval: Duration,
    /// Ceiling on buffered consistent queries per run.
    pub max_buffered_query_count: usize,
    /// Ceiling on signals per execution; zero disables the check.
    pub maximum_signals_per_execution: usize,
    /// Global switch for strong-consistency queries.
    pub enable_consistent_query: bool,
    /// Per-domain opt-outs override the global switch.
    pub consistent_query_disabled_domains: HashSet<String>,
    /// Whether direct query dispatch may try the sticky task list first.
    pub enable_sticky_query: bool,
    /// Upper bound for ids carried on requests (domain, workflow id, task
    /// list, workflow type).
    pub max_id_length: usize,
    /// Clamp for a request's decision start-to-close timeout.
    pub max_decision_start_to_close_timeout: Duration,
    /// Capacity of the execution cache before LRU eviction.
    pub execution_cache_max_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: Duration::from_millis(500),
            conditional_retry_count: 5,
            long_poll_expiration_interval: Duration::from_secs(20),
            query_first_decision_task_wait: Duration::from_secs(1),
            query_first_decision_task_check_interval: Duration::from_millis(200),
            max_buffered_query_count: 1,
            maximum_signals_per_execution: 10_000,
            enable_consistent_query: true,
            consistent_query_disabled_domains: HashSet::new(),
            enable_sticky_query: true,
            max_id_length: 1_000,
            max_decision_start_to_close_timeout: Duration::from_secs(60),
            execution_cache_max_size: 512,
        }
    }
}

impl EngineConfig {
    /// Strong-consistency queries are enabled iff the global switch is on
    /// and the domain has not opted out.
    pub fn consistent_query_enabled(&self, domain_name: &str) -> bool {
        self.enable_consistent_query
            && !self.consistent_query_disabled_domains.contains(domain_name)
    }
}
