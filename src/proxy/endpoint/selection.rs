use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::models::{StrategyConfig, StrategyKind};
use crate::proxy::endpoint::fast_test::FastTester;
use crate::proxy::endpoint::groups::GroupManager;
use crate::proxy::endpoint::types::Endpoint;

// Candidate selection. Works over a registry snapshot without holding
// the registry lock; per-endpoint read locks are taken only to read
// status fields.

#[derive(Debug, Default)]
pub struct SelectionRequest {
    // Endpoints already tried in this request, excluded from reselection.
    pub exclude: HashSet<String>,
    // Set for count_tokens paths; prefers capable endpoints.
    pub wants_count_tokens: bool,
}

pub(crate) async fn select_candidates(
    snapshot: &[Arc<Endpoint>],
    groups: &GroupManager,
    fast_tester: &FastTester,
    strategy: &StrategyConfig,
    failover_enabled: bool,
    request: &SelectionRequest,
) -> Vec<Arc<Endpoint>> {
    let now = chrono::Utc::now().timestamp_millis();
    let active = groups.filter_endpoints_by_active_groups(snapshot);

    let mut primary: Vec<Arc<Endpoint>> = active
        .iter()
        .filter(|ep| !request.exclude.contains(&ep.config.name))
        .filter(|ep| {
            let available = ep.is_available(now);
            if !available && ep.in_cooldown(now) {
                debug!("[Selection] Skipping cooling endpoint: {}", ep.config.name);
            }
            available
        })
        .cloned()
        .collect();

    if primary.is_empty() && failover_enabled {
        info!("[Failover] Active endpoints unavailable, building failover candidate list");
        primary = failover_candidates(snapshot, &active, &request.exclude, now);
        if !primary.is_empty() {
            info!("[Failover] Found {} failover candidate(s)", primary.len());
        }
    }

    primary = prefer_count_tokens_capable(primary, request.wants_count_tokens);
    sort_by_strategy(&mut primary, strategy, fast_tester).await;
    primary
}

// Endpoints outside the active groups that may serve as failover
// targets: failover participation on, healthy, not cooling.
fn failover_candidates(
    snapshot: &[Arc<Endpoint>],
    active: &[Arc<Endpoint>],
    exclude: &HashSet<String>,
    now: i64,
) -> Vec<Arc<Endpoint>> {
    let active_names: HashSet<&str> = active.iter().map(|ep| ep.config.name.as_str()).collect();

    snapshot
        .iter()
        .filter(|ep| !active_names.contains(ep.config.name.as_str()))
        .filter(|ep| !exclude.contains(&ep.config.name))
        .filter(|ep| ep.config.participates_in_failover())
        .filter(|ep| {
            if ep.in_cooldown(now) {
                debug!("[Failover] Skipping cooling endpoint: {}", ep.config.name);
                return false;
            }
            ep.is_healthy()
        })
        .cloned()
        .collect()
}

// count_tokens requests go to capable endpoints when any advertises the
// capability; otherwise the request passes through unchanged.
fn prefer_count_tokens_capable(
    candidates: Vec<Arc<Endpoint>>,
    wants_count_tokens: bool,
) -> Vec<Arc<Endpoint>> {
    if !wants_count_tokens {
        return candidates;
    }
    let capable: Vec<Arc<Endpoint>> = candidates
        .iter()
        .filter(|ep| ep.config.supports_count_tokens)
        .cloned()
        .collect();
    if capable.is_empty() {
        candidates
    } else {
        capable
    }
}

async fn sort_by_strategy(
    candidates: &mut Vec<Arc<Endpoint>>,
    strategy: &StrategyConfig,
    fast_tester: &FastTester,
) {
    match strategy.kind {
        StrategyKind::Priority => {
            candidates.sort_by(|a, b| {
                a.config
                    .priority
                    .cmp(&b.config.priority)
                    .then_with(|| a.config.name.cmp(&b.config.name))
            });
        }
        StrategyKind::Fastest => {
            if strategy.fast_test_enabled && candidates.len() > 1 {
                let (results, used_cache) = fast_tester
                    .test_endpoints(
                        candidates,
                        Duration::from_millis(strategy.fast_test_timeout_ms),
                        Duration::from_secs(strategy.fast_test_cache_ttl_secs),
                    )
                    .await;

                let any_success = results.values().any(|l| l.is_some());
                if any_success {
                    candidates.sort_by(|a, b| {
                        let la = measured_or_probe_latency(&results, a);
                        let lb = measured_or_probe_latency(&results, b);
                        la.cmp(&lb)
                            .then_with(|| a.config.name.cmp(&b.config.name))
                    });
                    if let Some(fastest) = candidates.first() {
                        info!(
                            "[Fastest] Selected fastest endpoint: {}{}",
                            fastest.config.name,
                            if used_cache { " (cached)" } else { "" }
                        );
                    }
                    return;
                }
                // All real-time probes failed; fall back to health-check
                // latencies.
                debug!("[Fastest] All real-time probes failed, using health-check latencies");
            }
            candidates.sort_by(|a, b| {
                probe_latency(a)
                    .cmp(&probe_latency(b))
                    .then_with(|| a.config.name.cmp(&b.config.name))
            });
        }
    }
}

fn probe_latency(ep: &Arc<Endpoint>) -> u64 {
    let status = ep.status();
    if status.never_checked {
        u64::MAX
    } else {
        status.response_time_ms
    }
}

fn measured_or_probe_latency(
    results: &std::collections::HashMap<String, Option<u64>>,
    ep: &Arc<Endpoint>,
) -> u64 {
    results
        .get(&ep.config.name)
        .copied()
        .flatten()
        .unwrap_or_else(|| probe_latency(ep).saturating_add(1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointConfig;
    use std::collections::HashMap;

    fn endpoint(name: &str, group: &str, priority: u32, failover: Option<bool>) -> Arc<Endpoint> {
        let ep = Arc::new(Endpoint::new(EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: group.to_string(),
            priority,
            tokens: Vec::new(),
            api_keys: Vec::new(),
            token: String::new(),
            api_key: String::new(),
            failover_enabled: failover,
            cooldown_secs: None,
            cost_multiplier: 1.0,
            supports_count_tokens: false,
            headers: HashMap::new(),
        }));
        ep.update_status(|s| {
            s.healthy = true;
            s.never_checked = false;
        });
        ep
    }

    fn strategy_priority() -> StrategyConfig {
        StrategyConfig::default()
    }

    async fn select(
        snapshot: &[Arc<Endpoint>],
        groups: &GroupManager,
        failover_enabled: bool,
        request: &SelectionRequest,
    ) -> Vec<String> {
        select_candidates(
            snapshot,
            groups,
            &FastTester::new(),
            &strategy_priority(),
            failover_enabled,
            request,
        )
        .await
        .into_iter()
        .map(|ep| ep.config.name.clone())
        .collect()
    }

    #[tokio::test]
    async fn priority_order_is_ascending_with_stable_name_tiebreak() {
        let snapshot = vec![
            endpoint("b", "g1", 2, None),
            endpoint("a", "g1", 2, None),
            endpoint("c", "g1", 1, None),
        ];
        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let names = select(&snapshot, &groups, true, &SelectionRequest::default()).await;
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn cooling_and_unhealthy_endpoints_are_skipped() {
        let snapshot = vec![
            endpoint("a", "g1", 1, None),
            endpoint("b", "g1", 2, None),
            endpoint("c", "g1", 3, None),
        ];
        let now = chrono::Utc::now().timestamp_millis();
        snapshot[0].update_status(|s| s.cooldown_until = now + 60_000);
        snapshot[1].update_status(|s| s.healthy = false);

        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let names = select(&snapshot, &groups, false, &SelectionRequest::default()).await;
        assert_eq!(names, vec!["c"]);
    }

    #[tokio::test]
    async fn failover_candidates_come_from_inactive_groups() {
        let snapshot = vec![
            endpoint("a", "g1", 1, None),
            endpoint("b", "g2", 2, None),
            endpoint("c", "g3", 3, Some(false)),
        ];
        // g1 active but its endpoint is unhealthy.
        snapshot[0].update_status(|s| s.healthy = false);

        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let names = select(&snapshot, &groups, true, &SelectionRequest::default()).await;
        // b is a valid failover target; c opted out of failover.
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn failover_disabled_yields_empty_selection() {
        let snapshot = vec![endpoint("a", "g1", 1, None), endpoint("b", "g2", 2, None)];
        snapshot[0].update_status(|s| s.healthy = false);

        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let names = select(&snapshot, &groups, false, &SelectionRequest::default()).await;
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn excluded_endpoints_never_reappear() {
        let snapshot = vec![endpoint("a", "g1", 1, None), endpoint("b", "g1", 2, None)];
        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let mut request = SelectionRequest::default();
        request.exclude.insert("a".to_string());
        let names = select(&snapshot, &groups, true, &request).await;
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn count_tokens_requests_prefer_capable_endpoints() {
        let mut capable = endpoint("a", "g1", 2, None);
        {
            let arc = Arc::get_mut(&mut capable).expect("sole owner");
            arc.config.supports_count_tokens = true;
        }
        let snapshot = vec![capable, endpoint("b", "g1", 1, None)];
        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let request = SelectionRequest {
            wants_count_tokens: true,
            ..Default::default()
        };
        let names = select(&snapshot, &groups, true, &request).await;
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn fastest_strategy_orders_by_probe_latency() {
        let snapshot = vec![
            endpoint("slow", "g1", 1, None),
            endpoint("quick", "g1", 1, None),
            endpoint("unchecked", "g1", 1, None),
        ];
        snapshot[0].update_status(|s| s.response_time_ms = 900);
        snapshot[1].update_status(|s| s.response_time_ms = 30);
        snapshot[2].update_status(|s| {
            s.never_checked = true;
        });

        let groups = GroupManager::new();
        groups.update_groups(&snapshot);
        groups.manual_activate_group("g1", false).expect("activate");

        let strategy = StrategyConfig {
            kind: StrategyKind::Fastest,
            fast_test_enabled: false,
            ..Default::default()
        };
        let names: Vec<String> = select_candidates(
            &snapshot,
            &groups,
            &FastTester::new(),
            &strategy,
            true,
            &SelectionRequest::default(),
        )
        .await
        .into_iter()
        .map(|ep| ep.config.name.clone())
        .collect();

        assert_eq!(names, vec!["quick", "slow", "unchecked"]);
    }
}
