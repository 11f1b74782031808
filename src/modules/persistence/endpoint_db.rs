use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::{CredentialEntry, EndpointConfig};

// Config store: one row per endpoint, keyed by the unique name. The
// credential lists and extra headers are stored as JSON columns.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEndpoint {
    pub config: EndpointConfig,
    pub enabled: bool,
}

pub fn get_db_path() -> Result<PathBuf, String> {
    let mut path = crate::modules::system::config::get_data_dir()?;
    path.push("endpoints.db");
    Ok(path)
}

pub fn connect_db() -> Result<Connection, String> {
    let path = get_db_path()?;
    let conn = Connection::open(&path).map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(conn)
}

pub fn init_db() -> Result<(), String> {
    let conn = connect_db()?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS endpoints (
            name TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            channel TEXT NOT NULL DEFAULT '',
            group_name TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 1,
            tokens TEXT NOT NULL DEFAULT '[]',
            api_keys TEXT NOT NULL DEFAULT '[]',
            token TEXT NOT NULL DEFAULT '',
            api_key TEXT NOT NULL DEFAULT '',
            failover_enabled INTEGER,
            cooldown_secs INTEGER,
            cost_multiplier REAL NOT NULL DEFAULT 1.0,
            supports_count_tokens INTEGER NOT NULL DEFAULT 0,
            headers TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create endpoints table: {}", e))?;

    Ok(())
}

fn row_to_stored(row: &Row<'_>) -> rusqlite::Result<StoredEndpoint> {
    let tokens_json: String = row.get("tokens")?;
    let api_keys_json: String = row.get("api_keys")?;
    let headers_json: String = row.get("headers")?;

    let tokens: Vec<CredentialEntry> = serde_json::from_str(&tokens_json).unwrap_or_default();
    let api_keys: Vec<CredentialEntry> = serde_json::from_str(&api_keys_json).unwrap_or_default();
    let headers = serde_json::from_str(&headers_json).unwrap_or_default();

    Ok(StoredEndpoint {
        config: EndpointConfig {
            name: row.get("name")?,
            url: row.get("url")?,
            channel: row.get("channel")?,
            group: row.get("group_name")?,
            priority: row.get::<_, i64>("priority")? as u32,
            tokens,
            api_keys,
            token: row.get("token")?,
            api_key: row.get("api_key")?,
            failover_enabled: row
                .get::<_, Option<i64>>("failover_enabled")?
                .map(|v| v != 0),
            cooldown_secs: row
                .get::<_, Option<i64>>("cooldown_secs")?
                .map(|v| v as u64),
            cost_multiplier: row.get("cost_multiplier")?,
            supports_count_tokens: row.get::<_, i64>("supports_count_tokens")? != 0,
            headers,
        },
        enabled: row.get::<_, i64>("enabled")? != 0,
    })
}

pub fn list_endpoints() -> Result<Vec<StoredEndpoint>, String> {
    let conn = connect_db()?;
    let mut stmt = conn
        .prepare("SELECT * FROM endpoints ORDER BY priority ASC, name ASC")
        .map_err(|e| format!("Failed to prepare query: {}", e))?;

    let rows = stmt
        .query_map([], row_to_stored)
        .map_err(|e| format!("Failed to query endpoints: {}", e))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| format!("Failed to read endpoint row: {}", e))?);
    }
    Ok(result)
}

pub fn get_endpoint(name: &str) -> Result<Option<StoredEndpoint>, String> {
    let conn = connect_db()?;
    conn.query_row(
        "SELECT * FROM endpoints WHERE name = ?1",
        params![name],
        row_to_stored,
    )
    .optional()
    .map_err(|e| format!("Failed to read endpoint '{}': {}", name, e))
}

pub fn create_endpoint(config: &EndpointConfig, enabled: bool) -> Result<(), String> {
    let conn = connect_db()?;
    let now = Utc::now().timestamp();
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO endpoints (
                name, url, channel, group_name, priority, tokens, api_keys,
                token, api_key, failover_enabled, cooldown_secs,
                cost_multiplier, supports_count_tokens, headers, enabled,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                config.name,
                config.url,
                config.channel,
                config.group,
                config.priority as i64,
                serde_json::to_string(&config.tokens).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&config.api_keys).unwrap_or_else(|_| "[]".to_string()),
                config.token,
                config.api_key,
                config.failover_enabled.map(|v| v as i64),
                config.cooldown_secs.map(|v| v as i64),
                config.cost_multiplier,
                config.supports_count_tokens as i64,
                serde_json::to_string(&config.headers).unwrap_or_else(|_| "{}".to_string()),
                enabled as i64,
                now,
                now,
            ],
        )
        .map_err(|e| format!("Failed to insert endpoint '{}': {}", config.name, e))?;

    if inserted == 0 {
        return Err(format!("endpoint '{}' already exists", config.name));
    }
    Ok(())
}

pub fn update_endpoint(name: &str, config: &EndpointConfig) -> Result<(), String> {
    let conn = connect_db()?;
    let now = Utc::now().timestamp();
    let updated = conn
        .execute(
            "UPDATE endpoints SET
                url = ?2, channel = ?3, group_name = ?4, priority = ?5,
                tokens = ?6, api_keys = ?7, token = ?8, api_key = ?9,
                failover_enabled = ?10, cooldown_secs = ?11,
                cost_multiplier = ?12, supports_count_tokens = ?13,
                headers = ?14, updated_at = ?15
            WHERE name = ?1",
            params![
                name,
                config.url,
                config.channel,
                config.group,
                config.priority as i64,
                serde_json::to_string(&config.tokens).unwrap_or_else(|_| "[]".to_string()),
                serde_json::to_string(&config.api_keys).unwrap_or_else(|_| "[]".to_string()),
                config.token,
                config.api_key,
                config.failover_enabled.map(|v| v as i64),
                config.cooldown_secs.map(|v| v as i64),
                config.cost_multiplier,
                config.supports_count_tokens as i64,
                serde_json::to_string(&config.headers).unwrap_or_else(|_| "{}".to_string()),
                now,
            ],
        )
        .map_err(|e| format!("Failed to update endpoint '{}': {}", name, e))?;

    if updated == 0 {
        return Err(format!("endpoint '{}' not found", name));
    }
    Ok(())
}

pub fn delete_endpoint(name: &str) -> Result<(), String> {
    let conn = connect_db()?;
    let deleted = conn
        .execute("DELETE FROM endpoints WHERE name = ?1", params![name])
        .map_err(|e| format!("Failed to delete endpoint '{}': {}", name, e))?;

    if deleted == 0 {
        return Err(format!("endpoint '{}' not found", name));
    }
    Ok(())
}

pub fn set_enabled(name: &str, enabled: bool) -> Result<(), String> {
    let conn = connect_db()?;
    let now = Utc::now().timestamp();
    let updated = conn
        .execute(
            "UPDATE endpoints SET enabled = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, enabled as i64, now],
        )
        .map_err(|e| format!("Failed to toggle endpoint '{}': {}", name, e))?;

    if updated == 0 {
        return Err(format!("endpoint '{}' not found", name));
    }
    Ok(())
}

pub fn disable_all() -> Result<usize, String> {
    let conn = connect_db()?;
    let now = Utc::now().timestamp();
    conn.execute(
        "UPDATE endpoints SET enabled = 0, updated_at = ?1 WHERE enabled = 1",
        params![now],
    )
    .map_err(|e| format!("Failed to disable endpoints: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDataDir;
    use std::collections::HashMap;

    fn sample(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: "main".to_string(),
            group: "g1".to_string(),
            priority: 2,
            tokens: vec![CredentialEntry {
                name: "t1".to_string(),
                value: "tok-secret-value".to_string(),
            }],
            api_keys: Vec::new(),
            token: String::new(),
            api_key: String::new(),
            failover_enabled: Some(false),
            cooldown_secs: Some(120),
            cost_multiplier: 1.5,
            supports_count_tokens: true,
            headers: HashMap::from([("x-extra".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn endpoint_round_trips_through_the_store() {
        let _data_dir = TestDataDir::new("endpoint-db-crud");

        init_db().expect("init");
        create_endpoint(&sample("ep1"), true).expect("create");

        let stored = get_endpoint("ep1").expect("get").expect("present");
        assert_eq!(stored.config.url, "https://api.example.com");
        assert_eq!(stored.config.priority, 2);
        assert_eq!(stored.config.failover_enabled, Some(false));
        assert_eq!(stored.config.cooldown_secs, Some(120));
        assert_eq!(stored.config.tokens[0].value, "tok-secret-value");
        assert!(stored.enabled);

        // Duplicate names are rejected.
        assert!(create_endpoint(&sample("ep1"), true).is_err());

        delete_endpoint("ep1").expect("delete");
        assert!(get_endpoint("ep1").expect("get").is_none());
    }

    #[test]
    fn disable_all_then_enable_one() {
        let _data_dir = TestDataDir::new("endpoint-db-toggle");

        init_db().expect("init");
        create_endpoint(&sample("a"), true).expect("create a");
        create_endpoint(&sample("b"), true).expect("create b");

        assert_eq!(disable_all().expect("disable"), 2);
        set_enabled("b", true).expect("enable b");

        let listed = list_endpoints().expect("list");
        let enabled: Vec<&str> = listed
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.config.name.as_str())
            .collect();
        assert_eq!(enabled, vec!["b"]);
    }
}
