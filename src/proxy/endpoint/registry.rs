use std::sync::Arc;
use std::sync::RwLock;

use tracing::info;

use crate::models::EndpointConfig;
use crate::proxy::endpoint::types::Endpoint;

// Registry primitives over the shared endpoint list. The lock is held
// only for the duration of a list mutation or a snapshot copy; callers
// iterate snapshots outside the lock.

pub(crate) type EndpointList = RwLock<Vec<Arc<Endpoint>>>;

pub(crate) fn snapshot(endpoints: &EndpointList) -> Vec<Arc<Endpoint>> {
    endpoints
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub(crate) fn count(endpoints: &EndpointList) -> usize {
    endpoints
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len()
}

pub(crate) fn by_name(endpoints: &EndpointList, name: &str) -> Option<Arc<Endpoint>> {
    endpoints
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .find(|ep| ep.config.name == name)
        .cloned()
}

// Replaces the whole list, used at boot when loading from the config
// store. Returns the fresh snapshot for group rebuild.
pub(crate) fn sync(endpoints: &EndpointList, configs: Vec<EndpointConfig>) -> Vec<Arc<Endpoint>> {
    let list: Vec<Arc<Endpoint>> = configs
        .into_iter()
        .map(|cfg| Arc::new(Endpoint::new(cfg)))
        .collect();

    let mut guard = endpoints
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = list.clone();
    info!("[Registry] Synced {} endpoint(s)", list.len());
    list
}

pub(crate) fn add(
    endpoints: &EndpointList,
    config: EndpointConfig,
) -> Result<Arc<Endpoint>, String> {
    let mut guard = endpoints
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.iter().any(|ep| ep.config.name == config.name) {
        return Err(format!("endpoint '{}' already exists", config.name));
    }
    let endpoint = Arc::new(Endpoint::new(config));
    guard.push(endpoint.clone());
    info!(
        "[Registry] Added endpoint: {} ({})",
        endpoint.config.name, endpoint.config.url
    );
    Ok(endpoint)
}

pub(crate) fn remove(endpoints: &EndpointList, name: &str) -> Result<Arc<Endpoint>, String> {
    let mut guard = endpoints
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let index = guard
        .iter()
        .position(|ep| ep.config.name == name)
        .ok_or_else(|| format!("endpoint '{}' not found", name))?;
    let removed = guard.remove(index);
    info!("[Registry] Removed endpoint: {}", name);
    Ok(removed)
}

// Replaces the config while preserving the name and carrying the current
// status over into the new record. The swap is atomic for readers: old
// snapshots keep the old record, new snapshots see the new one.
pub(crate) fn update(
    endpoints: &EndpointList,
    name: &str,
    mut config: EndpointConfig,
) -> Result<Arc<Endpoint>, String> {
    config.name = name.to_string();

    let mut guard = endpoints
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let index = guard
        .iter()
        .position(|ep| ep.config.name == name)
        .ok_or_else(|| format!("endpoint '{}' not found", name))?;

    let status = guard[index].status();
    let replacement = Arc::new(Endpoint::with_status(config, status));
    guard[index] = replacement.clone();
    info!("[Registry] Updated endpoint config: {}", name);
    Ok(replacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(name: &str, priority: u32) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: String::new(),
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

    #[test]
    fn add_then_remove_leaves_registry_unchanged() {
        let endpoints = EndpointList::default();
        assert_eq!(count(&endpoints), 0);

        add(&endpoints, config("a", 1)).expect("add");
        assert_eq!(count(&endpoints), 1);

        remove(&endpoints, "a").expect("remove");
        assert_eq!(count(&endpoints), 0);
        assert!(by_name(&endpoints, "a").is_none());
        assert!(snapshot(&endpoints).is_empty());
    }

    #[test]
    fn duplicate_add_fails() {
        let endpoints = EndpointList::default();
        add(&endpoints, config("a", 1)).expect("add");
        assert!(add(&endpoints, config("a", 2)).is_err());
        assert_eq!(count(&endpoints), 1);
    }

    #[test]
    fn remove_missing_fails() {
        let endpoints = EndpointList::default();
        assert!(remove(&endpoints, "ghost").is_err());
    }

    #[test]
    fn update_preserves_name_and_status() {
        let endpoints = EndpointList::default();
        let original = add(&endpoints, config("a", 1)).expect("add");
        original.update_status(|s| {
            s.healthy = true;
            s.never_checked = false;
            s.response_time_ms = 42;
        });

        let mut new_config = config("renamed-attempt", 9);
        new_config.url = "https://other.example.com".to_string();
        update(&endpoints, "a", new_config).expect("update");

        let updated = by_name(&endpoints, "a").expect("still addressed by old name");
        assert_eq!(updated.config.priority, 9);
        assert_eq!(updated.config.url, "https://other.example.com");
        let status = updated.status();
        assert!(status.healthy);
        assert_eq!(status.response_time_ms, 42);
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let endpoints = EndpointList::default();
        add(&endpoints, config("a", 1)).expect("add");
        let snap = snapshot(&endpoints);

        add(&endpoints, config("b", 2)).expect("add b");
        assert_eq!(snap.len(), 1);
        assert_eq!(count(&endpoints), 2);
    }
}
