//! Line-oriented process adapter: a JSON request on stdin, one JSON response
//! on stdout. Lets the web layer, cron jobs and operator scripts reach the
//! core without linking against it.

use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;

use simzis_core::audit_log::{query_audit_trail_at_db_path, Actor, AuditTrailRequest};
use simzis_core::bulk_import::{
    import_file_at_db_path, migration_log_errors_at_db_path, preview_file,
    query_migration_logs_at_db_path, ImportKind,
};
use simzis_core::catalog::{self, RefCategory};
use simzis_core::error::{CoreError, CoreResult};
use simzis_core::ledger_db::{
    apply_embedded_migrations, inspect_status_at_path, open_connection, table_counts_at_path,
};
use simzis_core::ledger_mutations::{
    delete_distribusi_at_db_path, delete_penerimaan_at_db_path, record_distribusi_at_db_path,
    record_penerimaan_at_db_path, update_distribusi_at_db_path, update_penerimaan_at_db_path,
    DistribusiDraft, PenerimaanDraft,
};
use simzis_core::party_registry::{
    delete_party_at_db_path, reconcile_party_aggregates_at_db_path, register_party_at_db_path,
    search_parties_at_db_path, set_party_status_at_db_path, update_party_at_db_path, PartyDraft,
    PartyKind, SearchPartiesRequest,
};
use simzis_core::statistics::{
    distribusi_stats_at_db_path, penerimaan_stats_at_db_path, query_distribusi_at_db_path,
    query_penerimaan_at_db_path, DistribusiQueryRequest, PenerimaanQueryRequest, StatsRequest,
};

#[derive(Deserialize)]
struct AdapterRequest {
    schema_version: u32,
    endpoint: Endpoint,
    #[serde(default)]
    query: Value,
    dataset: Dataset,
}

#[derive(Deserialize)]
struct Endpoint {
    path: String,
}

#[derive(Deserialize)]
struct Dataset {
    db_path: PathBuf,
}

fn parse_query<T: serde::de::DeserializeOwned>(query: &Value) -> CoreResult<T> {
    serde_json::from_value(query.clone())
        .map_err(|e| CoreError::validation(format!("parameter tidak valid: {e}")))
}

fn actor_from_query(query: &Value) -> Actor {
    Actor {
        user_id: query
            .get("user_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        address: query
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn str_param(query: &Value, key: &str) -> CoreResult<String> {
    query
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::validation(format!("parameter wajib: {key}")))
}

fn party_kind_param(query: &Value) -> CoreResult<PartyKind> {
    match str_param(query, "kind")?.to_lowercase().as_str() {
        "muzakki" => Ok(PartyKind::Muzakki),
        "mustahiq" => Ok(PartyKind::Mustahiq),
        other => Err(CoreError::validation(format!(
            "jenis pihak tidak dikenal: {other}"
        ))),
    }
}

fn to_json<T: serde::Serialize>(value: T) -> CoreResult<Value> {
    serde_json::to_value(value).map_err(|e| CoreError::Storage(e.to_string()))
}

fn dispatch(req: &AdapterRequest) -> CoreResult<Value> {
    let db_path = req.dataset.db_path.as_path();
    let query = &req.query;
    let actor = actor_from_query(query);

    match req.endpoint.path.as_str() {
        "ledger/migrate" => {
            let result = apply_embedded_migrations(db_path)?;
            let conn = open_connection(db_path)?;
            let seeded = catalog::seed_reference_catalog(&conn)?;
            let mut out = to_json(result)?;
            out["seeded_reference_entries"] = json!(seeded);
            Ok(out)
        }
        "ledger/status" => to_json(inspect_status_at_path(db_path)?),
        "ledger/table-counts" => to_json(table_counts_at_path(db_path)?),

        "catalog/children" => {
            let category = RefCategory::parse(&str_param(query, "category")?)?;
            let parent = str_param(query, "parent")?;
            let conn = open_connection(db_path)?;
            to_json(catalog::children(&conn, category, &parent)?)
        }

        "party/register" => {
            let kind = party_kind_param(query)?;
            let draft: PartyDraft = parse_query(&query["draft"])?;
            to_json(register_party_at_db_path(db_path, kind, &draft, &actor)?)
        }
        "party/update" => {
            let kind = party_kind_param(query)?;
            let id = str_param(query, "id")?;
            let draft: PartyDraft = parse_query(&query["draft"])?;
            to_json(update_party_at_db_path(db_path, kind, &id, &draft, &actor)?)
        }
        "party/status" => {
            let kind = party_kind_param(query)?;
            let id = str_param(query, "id")?;
            let status = str_param(query, "status")?;
            to_json(set_party_status_at_db_path(db_path, kind, &id, &status, &actor)?)
        }
        "party/delete" => {
            let kind = party_kind_param(query)?;
            let id = str_param(query, "id")?;
            to_json(delete_party_at_db_path(db_path, kind, &id, &actor)?)
        }
        "party/search" => {
            let kind = party_kind_param(query)?;
            let search: SearchPartiesRequest = parse_query(query)?;
            to_json(search_parties_at_db_path(db_path, kind, search)?)
        }
        "party/reconcile" => {
            let kind = party_kind_param(query)?;
            to_json(reconcile_party_aggregates_at_db_path(db_path, kind)?)
        }

        "penerimaan/record" => {
            let draft: PenerimaanDraft = parse_query(&query["draft"])?;
            to_json(record_penerimaan_at_db_path(db_path, &draft, &actor)?)
        }
        "penerimaan/update" => {
            let id = str_param(query, "id")?;
            let draft: PenerimaanDraft = parse_query(&query["draft"])?;
            to_json(update_penerimaan_at_db_path(db_path, &id, &draft, &actor)?)
        }
        "penerimaan/delete" => {
            let id = str_param(query, "id")?;
            to_json(delete_penerimaan_at_db_path(db_path, &id, &actor)?)
        }
        "penerimaan/query" => {
            let list: PenerimaanQueryRequest = parse_query(query)?;
            query_penerimaan_at_db_path(db_path, list)
        }
        "penerimaan/stats" => {
            let stats: StatsRequest = parse_query(query)?;
            penerimaan_stats_at_db_path(db_path, stats)
        }

        "distribusi/record" => {
            let draft: DistribusiDraft = parse_query(&query["draft"])?;
            to_json(record_distribusi_at_db_path(db_path, &draft, &actor)?)
        }
        "distribusi/update" => {
            let id = str_param(query, "id")?;
            let draft: DistribusiDraft = parse_query(&query["draft"])?;
            to_json(update_distribusi_at_db_path(db_path, &id, &draft, &actor)?)
        }
        "distribusi/delete" => {
            let id = str_param(query, "id")?;
            to_json(delete_distribusi_at_db_path(db_path, &id, &actor)?)
        }
        "distribusi/query" => {
            let list: DistribusiQueryRequest = parse_query(query)?;
            query_distribusi_at_db_path(db_path, list)
        }
        "distribusi/stats" => {
            let stats: StatsRequest = parse_query(query)?;
            distribusi_stats_at_db_path(db_path, stats)
        }

        "import/run" => {
            let kind = ImportKind::parse(&str_param(query, "kind")?)?;
            let file_path = PathBuf::from(str_param(query, "file_path")?);
            to_json(import_file_at_db_path(db_path, kind, &file_path, &actor, None)?)
        }
        "import/preview" => {
            let file_path = PathBuf::from(str_param(query, "file_path")?);
            let limit = query
                .get("limit")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            preview_file(&file_path, limit)
        }
        "import/logs" => {
            let kind = match query.get("kind").and_then(Value::as_str) {
                Some(raw) => Some(ImportKind::parse(raw)?),
                None => None,
            };
            let limit = query.get("limit").and_then(Value::as_u64).map(|n| n as u32);
            query_migration_logs_at_db_path(db_path, kind, limit)
        }
        "import/log-errors" => {
            let log_id = str_param(query, "log_id")?;
            migration_log_errors_at_db_path(db_path, &log_id)
        }

        "audit/trail" => {
            let trail: AuditTrailRequest = parse_query(query)?;
            query_audit_trail_at_db_path(db_path, trail)
        }

        other => Err(CoreError::validation(format!(
            "endpoint tidak dikenal: {other}"
        ))),
    }
}

fn run() -> Value {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        return json!({
            "status": "error",
            "category": "ValidationError",
            "message": format!("gagal membaca stdin: {e}"),
        });
    }

    let req: AdapterRequest = match serde_json::from_str(&input) {
        Ok(req) => req,
        Err(e) => {
            return json!({
                "status": "error",
                "category": "ValidationError",
                "message": format!("permintaan tidak valid: {e}"),
            })
        }
    };
    if req.schema_version != 1 {
        return json!({
            "status": "error",
            "category": "ValidationError",
            "message": format!("schema_version tidak didukung: {}", req.schema_version),
        });
    }

    match dispatch(&req) {
        Ok(data) => json!({ "status": "success", "data": data }),
        Err(err) => json!({
            "status": "error",
            "category": err.kind(),
            "message": err.to_string(),
        }),
    }
}

fn main() {
    env_logger::init();
    let response = run();
    println!("{response}");
}
