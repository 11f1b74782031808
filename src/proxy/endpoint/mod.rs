use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::{AppConfig, EndpointConfig};
use crate::proxy::events::{EventBus, Topic};

mod failover;
mod groups;
mod health;
mod keys;
mod registry;
mod selection;
mod types;

pub use failover::FailoverHook;
pub use groups::{GroupInfo, GroupManager};
pub use selection::SelectionRequest;
pub use types::{Endpoint, EndpointStatus};

use fast_test::FastTester;
use registry::EndpointList;

// Owner of the endpoint registry and its dynamic state. Ownership is a
// one-way DAG: the manager owns endpoints, the group manager reads
// snapshots, and all notifications flow outward through the event bus.
pub struct EndpointManager {
    endpoints: Arc<EndpointList>,
    groups: Arc<GroupManager>,
    fast_tester: Arc<FastTester>,
    event_bus: EventBus,
    config: Arc<tokio::sync::RwLock<AppConfig>>,
    probe_client: reqwest::Client,
    on_failover: parking_lot::RwLock<Option<FailoverHook>>,
    prober_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl EndpointManager {
    pub fn new(config: Arc<tokio::sync::RwLock<AppConfig>>, event_bus: EventBus) -> Self {
        Self {
            endpoints: Arc::new(EndpointList::default()),
            groups: Arc::new(GroupManager::new()),
            fast_tester: Arc::new(FastTester::new()),
            event_bus,
            config,
            probe_client: health::build_probe_client(),
            on_failover: parking_lot::RwLock::new(None),
            prober_handle: tokio::sync::Mutex::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    // Registered by the app layer to sync the config store after a
    // request-level failover switches groups.
    pub fn set_on_failover(&self, hook: FailoverHook) {
        *self.on_failover.write() = Some(hook);
    }

    // ---- registry -------------------------------------------------------

    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        registry::snapshot(&self.endpoints)
    }

    pub fn count(&self) -> usize {
        registry::count(&self.endpoints)
    }

    pub fn by_name_any(&self, name: &str) -> Option<Arc<Endpoint>> {
        registry::by_name(&self.endpoints, name)
    }

    // Lookup restricted to endpoints whose group is currently active.
    pub fn by_name_active(&self, name: &str) -> Option<Arc<Endpoint>> {
        let snapshot = self.snapshot();
        self.groups
            .filter_endpoints_by_active_groups(&snapshot)
            .into_iter()
            .find(|ep| ep.config.name == name)
    }

    // Boot-time load from the config store: replaces the endpoint list
    // and activates the groups of enabled endpoints.
    pub fn sync_endpoints(&self, configs: Vec<EndpointConfig>, enabled: Vec<String>) {
        let snapshot = registry::sync(&self.endpoints, configs);
        self.groups.update_groups(&snapshot);
        for name in &enabled {
            if let Some(ep) = snapshot.iter().find(|ep| &ep.config.name == name) {
                let _ = self.groups.manual_activate_group(ep.config.group_key(), true);
            }
        }
        info!(
            "[Endpoints] Synced {} endpoint(s), {} enabled",
            snapshot.len(),
            enabled.len()
        );
    }

    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<(), String> {
        let added = registry::add(&self.endpoints, config)?;
        self.groups.update_groups(&self.snapshot());

        let health_config = self.config.read().await.health_check.clone();
        health::probe_endpoint_soon(
            self.probe_client.clone(),
            added.clone(),
            &health_config,
            self.event_bus.clone(),
        );

        self.event_bus.emit(
            Topic::EndpointUpdate,
            "endpoint_added",
            json!({
                "name": added.config.name,
                "url": added.config.url,
                "priority": added.config.priority,
            }),
        );
        Ok(())
    }

    pub fn remove_endpoint(&self, name: &str) -> Result<(), String> {
        let removed = registry::remove(&self.endpoints, name)?;
        self.fast_tester.invalidate(name);
        self.groups.update_groups(&self.snapshot());

        self.event_bus.emit(
            Topic::EndpointUpdate,
            "endpoint_removed",
            json!({
                "name": name,
                "url": removed.config.url,
            }),
        );
        Ok(())
    }

    pub async fn update_endpoint_config(
        &self,
        name: &str,
        config: EndpointConfig,
    ) -> Result<(), String> {
        let updated = registry::update(&self.endpoints, name, config)?;
        self.fast_tester.invalidate(name);
        self.groups.update_groups(&self.snapshot());

        let health_config = self.config.read().await.health_check.clone();
        health::probe_endpoint_soon(
            self.probe_client.clone(),
            updated.clone(),
            &health_config,
            self.event_bus.clone(),
        );

        self.event_bus.emit(
            Topic::EndpointUpdate,
            "endpoint_updated",
            json!({
                "name": name,
                "url": updated.config.url,
                "priority": updated.config.priority,
            }),
        );
        Ok(())
    }

    // ---- health ---------------------------------------------------------

    pub async fn start_prober(&self) {
        let health_config = self.config.read().await.health_check.clone();
        let handle = health::spawn_prober(
            self.endpoints.clone(),
            self.probe_client.clone(),
            self.event_bus.clone(),
            health_config,
            self.cancel_token.child_token(),
        );

        let mut guard = self.prober_handle.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
            warn!("[Health] Aborted previous prober task");
        }
        *guard = Some(handle);
    }

    pub async fn run_health_check_now(&self) {
        let health_config = self.config.read().await.health_check.clone();
        health::run_health_check(
            &self.endpoints,
            &self.probe_client,
            &self.event_bus,
            &health_config,
        )
        .await;
    }

    // Cancel the prober and wait for it within the timeout.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();
        let handle = self.prober_handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => info!("[Endpoints] Prober stopped cleanly"),
                Err(_) => warn!("[Endpoints] Prober stop timed out after {:?}", timeout),
            }
        }
    }

    // ---- selection and failover ----------------------------------------

    pub async fn select_candidates(&self, request: &SelectionRequest) -> Vec<Arc<Endpoint>> {
        let (strategy, failover_enabled) = {
            let config = self.config.read().await;
            (config.strategy.clone(), config.failover.enabled)
        };
        let snapshot = self.snapshot();
        selection::select_candidates(
            &snapshot,
            &self.groups,
            &self.fast_tester,
            &strategy,
            failover_enabled,
            request,
        )
        .await
    }

    pub async fn trigger_request_failover(
        &self,
        failed_name: &str,
        reason: &str,
    ) -> Result<String, String> {
        let failover_config = self.config.read().await.failover.clone();
        let hook = self.on_failover.read().clone();
        failover::trigger_request_failover(
            &self.endpoints,
            &self.groups,
            &failover_config,
            &self.event_bus,
            hook,
            failed_name,
            reason,
        )
    }

    pub async fn cooldown_endpoint(&self, name: &str, reason: &str) -> Result<(), String> {
        let endpoint = self
            .by_name_any(name)
            .ok_or_else(|| format!("endpoint '{}' not found", name))?;
        let failover_config = self.config.read().await.failover.clone();
        let duration = failover::cooldown_duration_secs(&endpoint, &failover_config);
        failover::set_cooldown(
            &endpoint,
            duration,
            failover_config.max_cooldown_secs,
            reason,
        );
        Ok(())
    }

    pub fn clear_endpoint_cooldown(&self, name: &str) {
        if let Some(endpoint) = self.by_name_any(name) {
            failover::clear_cooldown(&endpoint);
        }
    }

    // ---- groups ---------------------------------------------------------

    pub fn get_groups(&self) -> Vec<GroupInfo> {
        self.groups.get_groups()
    }

    // Manual activation also lifts the cooldown of the group's endpoints:
    // the operator explicitly chose them.
    pub fn manual_activate_group(&self, name: &str, force: bool) -> Result<(), String> {
        self.groups.manual_activate_group(name, force)?;
        for ep in self.snapshot() {
            if ep.config.group_key() == name {
                failover::clear_cooldown(&ep);
            }
        }
        let kind = if force {
            "group_force_activated"
        } else {
            "group_manually_activated"
        };
        self.notify_group_change(kind, name);
        Ok(())
    }

    pub fn manual_pause_group(&self, name: &str, duration: Option<Duration>) -> Result<(), String> {
        // Operator pause defaults to one hour.
        let duration = duration.unwrap_or(Duration::from_secs(3_600));
        self.groups
            .manual_pause_group(name, duration.as_millis() as i64)?;
        self.notify_group_change("group_manually_paused", name);
        Ok(())
    }

    pub fn manual_resume_group(&self, name: &str) -> Result<(), String> {
        self.groups.manual_resume_group(name)?;
        self.notify_group_change("group_manually_resumed", name);
        Ok(())
    }

    fn notify_group_change(&self, kind: &str, group: &str) {
        self.event_bus.emit(
            Topic::GroupUpdate,
            kind,
            json!({
                "group": group,
                "groups": self.groups.get_groups(),
            }),
        );
    }

    // ---- credentials ----------------------------------------------------

    pub fn switch_endpoint_token(&self, name: &str, index: usize) -> Result<(), String> {
        keys::switch_token(&self.endpoints, &self.event_bus, name, index)
    }

    pub fn switch_endpoint_api_key(&self, name: &str, index: usize) -> Result<(), String> {
        keys::switch_api_key(&self.endpoints, &self.event_bus, name, index)
    }

    pub fn get_endpoint_keys(&self, name: &str) -> Option<serde_json::Value> {
        keys::keys_info(&self.endpoints, name)
    }
}

#[cfg(test)]
mod manager_tests {
    use super::*;
    use std::collections::HashMap;

    fn config(name: &str, group: &str, priority: u32) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: group.to_string(),
            priority,
            tokens: Vec::new(),
            api_keys: Vec::new(),
            token: String::new(),
            api_key: String::new(),
            failover_enabled: None,
            cooldown_secs: None,
            cost_multiplier: 1.0,
            supports_count_tokens: false,
            headers: HashMap::new(),
        }
    }

    fn manager() -> EndpointManager {
        EndpointManager::new(
            Arc::new(tokio::sync::RwLock::new(AppConfig::default())),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn add_rebuilds_groups_and_emits_event() {
        let manager = manager();
        let mut sub = manager.event_bus().subscribe();

        manager.add_endpoint(config("a", "g1", 1)).await.expect("add");
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get_groups().len(), 1);

        let event = sub.recv().await.expect("event");
        assert_eq!(event.kind, "endpoint_added");
        assert_eq!(event.data["name"], "a");
    }

    #[tokio::test]
    async fn remove_endpoint_clears_registry_and_groups() {
        let manager = manager();
        manager.add_endpoint(config("a", "g1", 1)).await.expect("add");
        manager.remove_endpoint("a").expect("remove");

        assert!(manager.by_name_any("a").is_none());
        assert_eq!(manager.count(), 0);
        assert!(manager.get_groups().is_empty());
        assert!(manager.remove_endpoint("a").is_err());
    }

    #[tokio::test]
    async fn double_update_is_equivalent_to_single_update() {
        let manager = manager();
        manager.add_endpoint(config("a", "g1", 1)).await.expect("add");

        let new_config = config("a", "g2", 7);
        manager
            .update_endpoint_config("a", new_config.clone())
            .await
            .expect("first update");
        manager
            .update_endpoint_config("a", new_config)
            .await
            .expect("second update");

        let ep = manager.by_name_any("a").expect("endpoint");
        assert_eq!(ep.config.priority, 7);
        assert_eq!(ep.config.group, "g2");
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn sync_activates_groups_of_enabled_endpoints() {
        let manager = manager();
        manager.sync_endpoints(
            vec![config("a", "g1", 1), config("b", "g2", 2)],
            vec!["b".to_string()],
        );

        assert!(!manager.groups().is_group_active("g1"));
        assert!(manager.groups().is_group_active("g2"));
    }

    #[tokio::test]
    async fn manual_activation_clears_cooldown() {
        let manager = manager();
        manager.sync_endpoints(vec![config("a", "g1", 1)], vec![]);

        manager
            .cooldown_endpoint("a", "server error")
            .await
            .expect("cooldown");
        let now = chrono::Utc::now().timestamp_millis();
        assert!(manager.by_name_any("a").expect("ep").in_cooldown(now));

        manager.manual_activate_group("g1", false).expect("activate");
        assert!(!manager.by_name_any("a").expect("ep").in_cooldown(now));
    }

    #[tokio::test]
    async fn by_name_active_respects_group_activation() {
        let manager = manager();
        manager.sync_endpoints(vec![config("a", "g1", 1)], vec![]);
        assert!(manager.by_name_active("a").is_none());

        manager.manual_activate_group("g1", false).expect("activate");
        assert!(manager.by_name_active("a").is_some());
    }
}
