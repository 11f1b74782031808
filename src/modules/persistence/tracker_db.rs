use rusqlite::{params, Connection, Row};
use serde::Deserialize;
use std::path::PathBuf;

use crate::proxy::tracking::{RequestRecord, RequestStatus};

// Durable tracker store. The flusher writes finalized records with
// at-least-once semantics (INSERT OR REPLACE keyed by request id); the
// admin API reads them back with simple filters.

pub fn get_db_path() -> Result<PathBuf, String> {
    let mut path = crate::modules::system::config::get_data_dir()?;
    path.push("tracker.db");
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
        "CREATE TABLE IF NOT EXISTS request_records (
            id INTEGER PRIMARY KEY,
            status TEXT NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            endpoint_name TEXT NOT NULL DEFAULT '',
            group_name TEXT NOT NULL DEFAULT '',
            retry_count INTEGER NOT NULL DEFAULT 0,
            http_status INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER,
            output_tokens INTEGER,
            cost REAL,
            error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| format!("Failed to create request_records table: {}", e))?;
    let _ = conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_records_status ON request_records(status)",
        [],
    );
    let _ = conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_records_endpoint ON request_records(endpoint_name)",
        [],
    );
    let _ = conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_records_created ON request_records(created_at)",
        [],
    );

    Ok(())
}

pub fn write_batch(records: &[RequestRecord]) -> Result<(), String> {
    if records.is_empty() {
        return Ok(());
    }
    let mut conn = connect_db()?;
    let tx = conn
        .transaction()
        .map_err(|e| format!("Failed to begin transaction: {}", e))?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT OR REPLACE INTO request_records (
                    id, status, method, path, endpoint_name, group_name,
                    retry_count, http_status, input_tokens, output_tokens,
                    cost, error, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )
            .map_err(|e| format!("Failed to prepare insert: {}", e))?;

        for record in records {
            stmt.execute(params![
                record.id as i64,
                record.status.as_str(),
                record.method,
                record.path,
                record.endpoint_name,
                record.group_name,
                record.retry_count as i64,
                record.http_status as i64,
                record.input_tokens.map(|v| v as i64),
                record.output_tokens.map(|v| v as i64),
                record.cost,
                record.error,
                record.created_at,
                record.updated_at,
            ])
            .map_err(|e| format!("Failed to insert record {}: {}", record.id, e))?;
        }
    }
    tx.commit()
        .map_err(|e| format!("Failed to commit batch: {}", e))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub status: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let status_str: String = row.get("status")?;
    Ok(RequestRecord {
        id: row.get::<_, i64>("id")? as u64,
        status: RequestStatus::parse(&status_str).unwrap_or(RequestStatus::Error),
        method: row.get("method")?,
        path: row.get("path")?,
        endpoint_name: row.get("endpoint_name")?,
        group_name: row.get("group_name")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        http_status: row.get::<_, i64>("http_status")? as u16,
        input_tokens: row.get::<_, Option<i64>>("input_tokens")?.map(|v| v as u32),
        output_tokens: row
            .get::<_, Option<i64>>("output_tokens")?
            .map(|v| v as u32),
        cost: row.get("cost")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn query(filter: &RecordFilter) -> Result<Vec<RequestRecord>, String> {
    let conn = connect_db()?;

    let mut sql = String::from("SELECT * FROM request_records WHERE 1=1");
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    if let Some(ref status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(Box::new(status.clone()));
    }
    if let Some(ref endpoint) = filter.endpoint {
        sql.push_str(" AND endpoint_name = ?");
        args.push(Box::new(endpoint.clone()));
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
    let limit = if filter.limit == 0 { 100 } else { filter.limit };
    args.push(Box::new(limit as i64));
    args.push(Box::new(filter.offset as i64));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| format!("Failed to prepare query: {}", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), row_to_record)
        .map_err(|e| format!("Failed to query records: {}", e))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| format!("Failed to read record row: {}", e))?);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDataDir;

    fn record(id: u64, status: RequestStatus, endpoint: &str) -> RequestRecord {
        RequestRecord {
            id,
            status,
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            endpoint_name: endpoint.to_string(),
            group_name: "g1".to_string(),
            retry_count: 0,
            http_status: 200,
            input_tokens: Some(10),
            output_tokens: Some(20),
            cost: Some(0.001),
            error: None,
            created_at: 1_700_000_000_000 + id as i64,
            updated_at: 1_700_000_000_000 + id as i64,
        }
    }

    #[test]
    fn write_batch_is_idempotent_per_record_id() {
        let _data_dir = TestDataDir::new("tracker-db");

        init_db().expect("init");
        let batch = vec![
            record(1, RequestStatus::Completed, "ep-a"),
            record(2, RequestStatus::ServerError, "ep-b"),
        ];
        write_batch(&batch).expect("write");
        // At-least-once delivery may replay the batch.
        write_batch(&batch).expect("rewrite");

        let all = query(&RecordFilter::default()).expect("query");
        assert_eq!(all.len(), 2);

        let errors = query(&RecordFilter {
            status: Some("server_error".to_string()),
            ..Default::default()
        })
        .expect("query errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].endpoint_name, "ep-b");

        let by_endpoint = query(&RecordFilter {
            endpoint: Some("ep-a".to_string()),
            ..Default::default()
        })
        .expect("query endpoint");
        assert_eq!(by_endpoint.len(), 1);
        assert_eq!(by_endpoint[0].status, RequestStatus::Completed);
    }
}
