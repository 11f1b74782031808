use serde_json::{json, Value};
use tracing::info;

use crate::models::mask_key;
use crate::proxy::endpoint::registry::{self, EndpointList};
use crate::proxy::events::{EventBus, Topic};

// Credential switching. The active indices live in the endpoint status;
// the configured lists stay immutable.

pub(crate) fn switch_token(
    endpoints: &EndpointList,
    event_bus: &EventBus,
    name: &str,
    index: usize,
) -> Result<(), String> {
    let endpoint =
        registry::by_name(endpoints, name).ok_or_else(|| format!("endpoint '{}' not found", name))?;

    if endpoint.config.tokens.is_empty() {
        return Err(format!("endpoint '{}' has no token list configured", name));
    }
    if index >= endpoint.config.tokens.len() {
        return Err(format!(
            "token index {} out of range for endpoint '{}' ({} configured)",
            index,
            name,
            endpoint.config.tokens.len()
        ));
    }

    endpoint.update_status(|status| status.active_token_index = index);

    let token_name = display_name(&endpoint.config.tokens[index].name, "Token", index);
    info!(
        "[KeySwitch] Endpoint {} token switched to: {} (index: {})",
        name, token_name, index
    );
    event_bus.emit(
        Topic::EndpointUpdate,
        "endpoint_key_changed",
        json!({
            "endpoint": name,
            "key_type": "token",
            "new_index": index,
            "key_name": token_name,
        }),
    );
    Ok(())
}

pub(crate) fn switch_api_key(
    endpoints: &EndpointList,
    event_bus: &EventBus,
    name: &str,
    index: usize,
) -> Result<(), String> {
    let endpoint =
        registry::by_name(endpoints, name).ok_or_else(|| format!("endpoint '{}' not found", name))?;

    if endpoint.config.api_keys.is_empty() {
        return Err(format!("endpoint '{}' has no api key list configured", name));
    }
    if index >= endpoint.config.api_keys.len() {
        return Err(format!(
            "api key index {} out of range for endpoint '{}' ({} configured)",
            index,
            name,
            endpoint.config.api_keys.len()
        ));
    }

    endpoint.update_status(|status| status.active_api_key_index = index);

    let key_name = display_name(&endpoint.config.api_keys[index].name, "API Key", index);
    info!(
        "[KeySwitch] Endpoint {} api key switched to: {} (index: {})",
        name, key_name, index
    );
    event_bus.emit(
        Topic::EndpointUpdate,
        "endpoint_key_changed",
        json!({
            "endpoint": name,
            "key_type": "api_key",
            "new_index": index,
            "key_name": key_name,
        }),
    );
    Ok(())
}

// Masked credential listing for the UI.
pub(crate) fn keys_info(endpoints: &EndpointList, name: &str) -> Option<Value> {
    let endpoint = registry::by_name(endpoints, name)?;
    let status = endpoint.status();

    let mut tokens: Vec<Value> = endpoint
        .config
        .tokens
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            json!({
                "index": i,
                "name": entry.name,
                "masked": mask_key(&entry.value),
                "is_active": status.active_token_index == i,
            })
        })
        .collect();
    if tokens.is_empty() && !endpoint.config.token.is_empty() {
        tokens.push(json!({
            "index": 0,
            "name": "default",
            "masked": mask_key(&endpoint.config.token),
            "is_active": true,
        }));
    }

    let mut api_keys: Vec<Value> = endpoint
        .config
        .api_keys
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            json!({
                "index": i,
                "name": entry.name,
                "masked": mask_key(&entry.value),
                "is_active": status.active_api_key_index == i,
            })
        })
        .collect();
    if api_keys.is_empty() && !endpoint.config.api_key.is_empty() {
        api_keys.push(json!({
            "index": 0,
            "name": "default",
            "masked": mask_key(&endpoint.config.api_key),
            "is_active": true,
        }));
    }

    let supports_switching =
        endpoint.config.tokens.len() > 1 || endpoint.config.api_keys.len() > 1;

    Some(json!({
        "endpoint": name,
        "tokens": tokens,
        "api_keys": api_keys,
        "supports_switching": supports_switching,
    }))
}

fn display_name(configured: &str, kind: &str, index: usize) -> String {
    if configured.is_empty() {
        format!("{} {}", kind, index + 1)
    } else {
        configured.to_string()
    }
}
