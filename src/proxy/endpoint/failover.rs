use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::models::FailoverConfig;
use crate::proxy::endpoint::groups::GroupManager;
use crate::proxy::endpoint::registry::{self, EndpointList};
use crate::proxy::endpoint::types::Endpoint;
use crate::proxy::events::{EventBus, Topic};

pub type FailoverHook = Arc<dyn Fn(String, String) + Send + Sync>;

// Cooldown is owned here and by the forwarding engine; the prober never
// writes it. Durations are clamped to the configured ceiling.
pub(crate) fn set_cooldown(
    endpoint: &Arc<Endpoint>,
    duration_secs: u64,
    max_secs: u64,
    reason: &str,
) {
    let capped = duration_secs.min(max_secs.max(1));
    let until = chrono::Utc::now().timestamp_millis() + (capped as i64) * 1_000;
    endpoint.update_status(|status| {
        status.cooldown_until = until;
        status.cooldown_reason = reason.to_string();
    });
    info!(
        "[Failover] Endpoint {} entering cooldown for {}s ({})",
        endpoint.config.name, capped, reason
    );
}

pub(crate) fn clear_cooldown(endpoint: &Arc<Endpoint>) {
    endpoint.update_status(|status| {
        if status.cooldown_until != 0 {
            info!(
                "[Cooldown] Cleared for {} (was: {})",
                endpoint.config.name, status.cooldown_reason
            );
            status.cooldown_until = 0;
            status.cooldown_reason.clear();
        }
    });
}

pub(crate) fn cooldown_duration_secs(endpoint: &Arc<Endpoint>, config: &FailoverConfig) -> u64 {
    match endpoint.config.cooldown_secs {
        Some(secs) if secs > 0 => secs,
        _ => config.default_cooldown_secs.max(1),
    }
}

// Request-level failover, called when a retryable billing-safe error
// exhausts an endpoint. Returns the newly activated endpoint name.
pub(crate) fn trigger_request_failover(
    endpoints: &EndpointList,
    groups: &GroupManager,
    config: &FailoverConfig,
    event_bus: &EventBus,
    on_failover: Option<FailoverHook>,
    failed_name: &str,
    reason: &str,
) -> Result<String, String> {
    warn!(
        "[Failover] Request-level failover triggered: {} ({})",
        failed_name, reason
    );

    let failed = registry::by_name(endpoints, failed_name)
        .ok_or_else(|| format!("endpoint '{}' not found", failed_name))?;

    let duration = cooldown_duration_secs(&failed, config);
    set_cooldown(&failed, duration, config.max_cooldown_secs, reason);

    if let Err(e) = groups.deactivate_group(failed.config.group_key()) {
        warn!("[Failover] Failed to deactivate group: {}", e);
    }

    let next = select_next_failover(endpoints, failed_name)
        .ok_or_else(|| "no failover endpoint available".to_string())?;

    let next_name = next.config.name.clone();
    // Transient activation: the new endpoint's group becomes active so
    // subsequent selections keep using it until the operator intervenes.
    groups
        .manual_activate_group(next.config.group_key(), false)
        .map_err(|e| format!("failed to activate failover group: {}", e))?;

    info!("[Failover] Switched to endpoint: {}", next_name);

    // failover_triggered is published before the new endpoint sees its
    // first request byte; the caller dials only after this returns.
    event_bus.emit(
        Topic::EndpointUpdate,
        "failover_triggered",
        json!({
            "failed": failed_name,
            "new": next_name,
            "reason": reason,
            "cooldown_secs": duration.min(config.max_cooldown_secs),
        }),
    );
    event_bus.emit(
        Topic::GroupUpdate,
        "group_switched",
        json!({
            "deactivated": failed.config.group_key(),
            "activated": next.config.group_key(),
        }),
    );

    if let Some(hook) = on_failover {
        let failed_name = failed_name.to_string();
        let new_name = next_name.clone();
        tokio::spawn(async move {
            hook(failed_name, new_name);
        });
    }

    Ok(next_name)
}

// Next failover target by ascending priority: participates in failover,
// healthy, not cooling, and not the endpoint that just failed.
pub(crate) fn select_next_failover(
    endpoints: &EndpointList,
    exclude: &str,
) -> Option<Arc<Endpoint>> {
    let mut snapshot = registry::snapshot(endpoints);
    snapshot.sort_by(|a, b| {
        a.config
            .priority
            .cmp(&b.config.priority)
            .then_with(|| a.config.name.cmp(&b.config.name))
    });

    let now = chrono::Utc::now().timestamp_millis();
    for ep in snapshot {
        if ep.config.name == exclude {
            continue;
        }
        if !ep.config.participates_in_failover() {
            continue;
        }
        if ep.in_cooldown(now) {
            debug!("[Failover] Skipping cooling endpoint: {}", ep.config.name);
            continue;
        }
        if !ep.is_healthy() {
            debug!("[Failover] Skipping unhealthy endpoint: {}", ep.config.name);
            continue;
        }
        return Some(ep);
    }

    error!("[Failover] No failover endpoint available");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndpointConfig;
    use std::collections::HashMap;

    fn endpoint(name: &str, priority: u32, failover: Option<bool>) -> Arc<Endpoint> {
        let ep = Arc::new(Endpoint::new(EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: String::new(),
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

    fn list_of(eps: Vec<Arc<Endpoint>>) -> EndpointList {
        EndpointList::new(eps)
    }

    #[test]
    fn cooldown_is_clamped_to_configured_maximum() {
        let ep = endpoint("a", 1, None);
        set_cooldown(&ep, 7_200, 600, "test");

        let status = ep.status();
        let now = chrono::Utc::now().timestamp_millis();
        assert!(status.cooldown_until <= now + 601_000);
        assert!(status.cooldown_until > now + 590_000);
        assert_eq!(status.cooldown_reason, "test");
    }

    #[test]
    fn clear_cooldown_resets_state() {
        let ep = endpoint("a", 1, None);
        set_cooldown(&ep, 60, 3_600, "test");
        clear_cooldown(&ep);

        let status = ep.status();
        assert_eq!(status.cooldown_until, 0);
        assert!(status.cooldown_reason.is_empty());
    }

    #[test]
    fn endpoint_cooldown_override_beats_default() {
        let mut cfg_ep = endpoint("a", 1, None);
        Arc::get_mut(&mut cfg_ep).unwrap().config.cooldown_secs = Some(42);
        let config = FailoverConfig::default();
        assert_eq!(cooldown_duration_secs(&cfg_ep, &config), 42);

        let plain = endpoint("b", 1, None);
        assert_eq!(cooldown_duration_secs(&plain, &config), 600);
    }

    #[test]
    fn next_failover_honors_priority_and_exclusions() {
        let endpoints = list_of(vec![
            endpoint("high", 1, None),
            endpoint("opted-out", 1, Some(false)),
            endpoint("low", 5, None),
        ]);

        let next = select_next_failover(&endpoints, "high").expect("candidate");
        assert_eq!(next.config.name, "low");
    }

    #[test]
    fn next_failover_skips_cooling_and_unhealthy() {
        let a = endpoint("a", 1, None);
        let b = endpoint("b", 2, None);
        let c = endpoint("c", 3, None);
        let now = chrono::Utc::now().timestamp_millis();
        a.update_status(|s| s.cooldown_until = now + 60_000);
        b.update_status(|s| s.healthy = false);
        let endpoints = list_of(vec![a, b, c]);

        let next = select_next_failover(&endpoints, "other").expect("candidate");
        assert_eq!(next.config.name, "c");
    }

    #[tokio::test]
    async fn trigger_failover_cools_deactivates_and_activates() {
        let failed = endpoint("a", 1, None);
        let standby = endpoint("b", 2, None);
        let endpoints = list_of(vec![failed.clone(), standby.clone()]);
        let groups = GroupManager::new();
        groups.update_groups(&registry::snapshot(&endpoints));
        groups.manual_activate_group("a", false).expect("activate a");

        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let config = FailoverConfig::default();

        let new_name = trigger_request_failover(
            &endpoints,
            &groups,
            &config,
            &bus,
            None,
            "a",
            "connection refused",
        )
        .expect("failover");

        assert_eq!(new_name, "b");
        let now = chrono::Utc::now().timestamp_millis();
        assert!(failed.in_cooldown(now));
        assert!(!groups.is_group_active("a"));
        assert!(groups.is_group_active("b"));

        let event = sub.recv().await.expect("event");
        assert_eq!(event.kind, "failover_triggered");
        assert_eq!(event.data["failed"], "a");
        assert_eq!(event.data["new"], "b");
    }

    #[tokio::test]
    async fn trigger_failover_fails_when_no_candidate() {
        let failed = endpoint("a", 1, None);
        let endpoints = list_of(vec![failed]);
        let groups = GroupManager::new();
        groups.update_groups(&registry::snapshot(&endpoints));

        let result = trigger_request_failover(
            &endpoints,
            &groups,
            &FailoverConfig::default(),
            &EventBus::new(),
            None,
            "a",
            "refused",
        );
        assert!(result.is_err());
    }
}
