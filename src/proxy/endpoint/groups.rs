use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::proxy::endpoint::types::Endpoint;

// Derived group state. Groups are rebuilt from registry snapshots; the
// rebuild happens off-lock against the snapshot and is swapped in under
// the group manager's own lock.

#[derive(Debug, Clone)]
struct GroupState {
    name: String,
    channel: String,
    endpoints: Vec<String>,
    priority: u32,
    is_active: bool,
    manually_paused: bool,
    cooldown_until: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub channel: String,
    pub active: bool,
    pub paused: bool,
    pub priority: u32,
    pub endpoint_count: usize,
    pub in_cooldown: bool,
    pub cooldown_remain_ms: i64,
}

pub struct GroupManager {
    groups: RwLock<HashMap<String, GroupState>>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    // Rebuilds the group map from a snapshot, carrying over the manual
    // activation/pause state of groups that survive the rebuild.
    pub fn update_groups(&self, snapshot: &[Arc<Endpoint>]) {
        let mut rebuilt: HashMap<String, GroupState> = HashMap::new();
        for ep in snapshot {
            let key = ep.config.group_key().to_string();
            let entry = rebuilt.entry(key.clone()).or_insert_with(|| GroupState {
                name: key,
                channel: ep.config.channel.clone(),
                endpoints: Vec::new(),
                priority: ep.config.priority,
                is_active: false,
                manually_paused: false,
                cooldown_until: 0,
            });
            entry.endpoints.push(ep.config.name.clone());
            entry.priority = entry.priority.min(ep.config.priority);
        }

        let mut groups = self.groups.write();
        for (name, state) in rebuilt.iter_mut() {
            if let Some(existing) = groups.get(name) {
                state.is_active = existing.is_active;
                state.manually_paused = existing.manually_paused;
                state.cooldown_until = existing.cooldown_until;
            }
        }
        debug!("[Groups] Rebuilt {} group(s)", rebuilt.len());
        *groups = rebuilt;
    }

    // Lazily expires a manual pause whose window has passed.
    fn pause_expired(state: &GroupState, now: i64) -> bool {
        state.manually_paused && state.cooldown_until != 0 && now >= state.cooldown_until
    }

    fn is_selectable(state: &GroupState, now: i64) -> bool {
        state.is_active && (!state.manually_paused || Self::pause_expired(state, now))
    }

    // Activation is exclusive at group granularity unless forced.
    pub fn manual_activate_group(&self, name: &str, force: bool) -> Result<(), String> {
        let mut groups = self.groups.write();
        if !groups.contains_key(name) {
            return Err(format!("group '{}' not found", name));
        }
        if !force {
            for state in groups.values_mut() {
                state.is_active = false;
            }
        }
        if let Some(state) = groups.get_mut(name) {
            state.is_active = true;
            state.manually_paused = false;
            state.cooldown_until = 0;
        }
        info!("[Groups] Activated group '{}' (force: {})", name, force);
        Ok(())
    }

    pub fn deactivate_group(&self, name: &str) -> Result<(), String> {
        let mut groups = self.groups.write();
        match groups.get_mut(name) {
            Some(state) => {
                state.is_active = false;
                info!("[Groups] Deactivated group '{}'", name);
                Ok(())
            }
            None => Err(format!("group '{}' not found", name)),
        }
    }

    pub fn manual_pause_group(&self, name: &str, duration_ms: i64) -> Result<(), String> {
        let mut groups = self.groups.write();
        match groups.get_mut(name) {
            Some(state) => {
                state.manually_paused = true;
                state.cooldown_until = chrono::Utc::now().timestamp_millis() + duration_ms;
                info!("[Groups] Paused group '{}' for {}ms", name, duration_ms);
                Ok(())
            }
            None => Err(format!("group '{}' not found", name)),
        }
    }

    pub fn manual_resume_group(&self, name: &str) -> Result<(), String> {
        let mut groups = self.groups.write();
        match groups.get_mut(name) {
            Some(state) => {
                state.manually_paused = false;
                state.cooldown_until = 0;
                info!("[Groups] Resumed group '{}'", name);
                Ok(())
            }
            None => Err(format!("group '{}' not found", name)),
        }
    }

    pub fn is_group_active(&self, name: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        self.groups
            .read()
            .get(name)
            .map(|state| Self::is_selectable(state, now))
            .unwrap_or(false)
    }

    pub fn has_active_group(&self) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        self.groups
            .read()
            .values()
            .any(|state| Self::is_selectable(state, now))
    }

    // Returns only endpoints whose group is active and not paused.
    pub fn filter_endpoints_by_active_groups(
        &self,
        snapshot: &[Arc<Endpoint>],
    ) -> Vec<Arc<Endpoint>> {
        let now = chrono::Utc::now().timestamp_millis();
        let groups = self.groups.read();
        snapshot
            .iter()
            .filter(|ep| {
                groups
                    .get(ep.config.group_key())
                    .map(|state| Self::is_selectable(state, now))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn get_groups(&self) -> Vec<GroupInfo> {
        let now = chrono::Utc::now().timestamp_millis();
        let groups = self.groups.read();
        let mut result: Vec<GroupInfo> = groups
            .values()
            .map(|state| {
                let paused = state.manually_paused && !Self::pause_expired(state, now);
                let remain = if paused && state.cooldown_until > now {
                    state.cooldown_until - now
                } else {
                    0
                };
                GroupInfo {
                    name: state.name.clone(),
                    channel: state.channel.clone(),
                    active: state.is_active,
                    paused,
                    priority: state.priority,
                    endpoint_count: state.endpoints.len(),
                    in_cooldown: remain > 0,
                    cooldown_remain_ms: remain,
                }
            })
            .collect();
        result.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        result
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}
