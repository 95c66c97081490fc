use rusqlite::{params, types::Value as SqlValue, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ledger_db::open_connection;

/// Identity supplied by the authentication collaborator.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Actor {
    pub user_id: Option<String>,
    pub address: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>) -> Self {
        Actor {
            user_id: Some(user_id.into()),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "INSERT",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

/// Writes one audit record inside the caller's transaction. A failure here
/// propagates, rolling back the enclosing mutation: audit completeness is a
/// correctness property, not best-effort logging.
pub fn record_audit(
    conn: &Connection,
    table_name: &str,
    action: AuditAction,
    before: Option<&Value>,
    after: Option<&Value>,
    actor: &Actor,
) -> CoreResult<()> {
    let before_json = before
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot audit: {e}")))?;
    let after_json = after
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot audit: {e}")))?;

    conn.execute(
        r#"
        INSERT INTO audit_records(id, user_id, table_name, action, before_json, after_json, actor_address)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            Uuid::new_v4().to_string(),
            actor.user_id,
            table_name,
            action.as_str(),
            before_json,
            after_json,
            actor.address,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditTrailRequest {
    pub table: Option<String>,
    pub action: Option<String>,
    #[serde(rename = "from")]
    pub from_ts: Option<String>,
    #[serde(rename = "to")]
    pub to_ts: Option<String>,
    pub limit: Option<u32>,
}

pub fn query_audit_trail_at_db_path(db_path: &Path, req: AuditTrailRequest) -> CoreResult<Value> {
    let limit = req.limit.unwrap_or(100).clamp(1, 500) as i64;
    let table = req.table.unwrap_or_default().trim().to_string();
    let action = req.action.unwrap_or_default().trim().to_uppercase();
    if !action.is_empty() && !["INSERT", "UPDATE", "DELETE"].contains(&action.as_str()) {
        return Err(CoreError::validation(
            "action hanya mendukung INSERT/UPDATE/DELETE".to_string(),
        ));
    }
    let from_ts = req.from_ts.unwrap_or_default().trim().to_string();
    let to_ts = req.to_ts.unwrap_or_default().trim().to_string();

    let mut conditions: Vec<&str> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    if !table.is_empty() {
        conditions.push("table_name = ?");
        params.push(SqlValue::Text(table.clone()));
    }
    if !action.is_empty() {
        conditions.push("action = ?");
        params.push(SqlValue::Text(action.clone()));
    }
    if !from_ts.is_empty() {
        conditions.push("created_at >= ?");
        params.push(SqlValue::Text(from_ts));
    }
    if !to_ts.is_empty() {
        conditions.push("created_at <= ?");
        params.push(SqlValue::Text(to_ts));
    }
    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let conn = open_connection(db_path)?;
    let rows_sql = format!(
        r#"
        SELECT id, user_id, table_name, action, before_json, after_json, actor_address, created_at
        FROM audit_records
        {where_sql}
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#
    );
    let mut rows_params = params.clone();
    rows_params.push(SqlValue::Integer(limit));
    let mut stmt = conn.prepare(&rows_sql)?;
    let iter = stmt.query_map(params_from_iter(rows_params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut rows = Vec::<Value>::new();
    for row in iter {
        let (id, user_id, table_name, action, before_json, after_json, actor_address, created_at) =
            row?;
        let before = before_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok());
        let after = after_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok());
        rows.push(json!({
            "id": id,
            "user_id": user_id,
            "table": table_name,
            "action": action,
            "before": before,
            "after": after,
            "actor_address": actor_address,
            "at": created_at,
        }));
    }

    let count_sql = format!("SELECT COUNT(*) FROM audit_records {where_sql}");
    let total: i64 = conn.query_row(&count_sql, params_from_iter(params.iter()), |row| row.get(0))?;

    Ok(json!({
        "summary": { "count": total, "limit": limit },
        "rows": rows,
    }))
}
