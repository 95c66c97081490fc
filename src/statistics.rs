use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::ledger_db::open_connection;
use crate::ledger_mutations::{
    distribusi_from_row, penerimaan_from_row, DISTRIBUSI_SELECT, PENERIMAAN_SELECT,
};

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 500;

/// Validates the year filter. A year is always required; reports never span
/// the whole ledger.
fn year_filter(raw: &str) -> CoreResult<String> {
    let text = raw.trim();
    let year: i32 = text
        .parse()
        .map_err(|_| CoreError::validation(format!("tahun tidak valid: {text}")))?;
    if !(2001..=9999).contains(&year) {
        return Err(CoreError::validation(format!("tahun tidak valid: {text}")));
    }
    Ok(format!("{year:04}"))
}

/// Tri-state month filter: absent, `"all"` or empty means the whole year;
/// otherwise a 1-12 month number, returned zero-padded for strftime.
fn month_filter(raw: &Option<String>) -> CoreResult<Option<String>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(text) => {
            let month: u32 = text
                .parse()
                .map_err(|_| CoreError::validation(format!("bulan tidak valid: {text}")))?;
            if !(1..=12).contains(&month) {
                return Err(CoreError::validation(format!("bulan tidak valid: {text}")));
            }
            Ok(Some(format!("{month:02}")))
        }
    }
}

fn clamp_limit(raw: Option<u32>) -> u32 {
    raw.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Debug, Default, Deserialize)]
pub struct PenerimaanQueryRequest {
    pub year: Option<String>,
    pub month: Option<String>,
    pub muzakki_id: Option<String>,
    pub via: Option<String>,
    pub metode_bayar: Option<String>,
    pub jenis_zis: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DistribusiQueryRequest {
    pub year: Option<String>,
    pub month: Option<String>,
    pub mustahiq_id: Option<String>,
    pub asnaf: Option<String>,
    pub program: Option<String>,
    pub sub_program: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatsRequest {
    pub dimension: String,
    pub year: String,
    pub month: Option<String>,
}

fn push_opt_filter(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    column: &str,
    value: &Option<String>,
) {
    if let Some(value) = value.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push(format!("{column} = ?"));
        params.push(SqlValue::Text(value.to_string()));
    }
}

fn period_clauses(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    date_column: &str,
    year: &Option<String>,
    month: &Option<String>,
) -> CoreResult<()> {
    if let Some(year) = year.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push(format!("strftime('%Y', {date_column}) = ?"));
        params.push(SqlValue::Text(year_filter(year)?));
        if let Some(month) = month_filter(month)? {
            clauses.push(format!("strftime('%m', {date_column}) = ?"));
            params.push(SqlValue::Text(month));
        }
    } else if month_filter(month)?.is_some() {
        return Err(CoreError::validation("filter bulan membutuhkan tahun"));
    }
    Ok(())
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

/// Filtered receipt listing with an aggregate summary over the whole
/// filtered set, not just the returned page.
pub fn query_penerimaan_at_db_path(
    db_path: &Path,
    req: PenerimaanQueryRequest,
) -> CoreResult<Value> {
    let conn = open_connection(db_path)?;
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    period_clauses(&mut clauses, &mut params, "p.tanggal", &req.year, &req.month)?;
    push_opt_filter(&mut clauses, &mut params, "p.muzakki_id", &req.muzakki_id);
    push_opt_filter(&mut clauses, &mut params, "v.name", &req.via);
    push_opt_filter(&mut clauses, &mut params, "m.name", &req.metode_bayar);
    push_opt_filter(&mut clauses, &mut params, "j.name", &req.jenis_zis);

    let where_sql = where_sql(&clauses);
    let summary_sql = format!(
        r#"
        SELECT COUNT(*), COALESCE(SUM(p.jumlah_cents), 0),
               COALESCE(SUM(p.amil_cents), 0), COALESCE(SUM(p.bersih_cents), 0)
        FROM penerimaan p
        JOIN reference_entries v ON v.id = p.via_id
        JOIN reference_entries m ON m.id = p.metode_bayar_id
        JOIN reference_entries j ON j.id = p.jenis_zis_id
        {where_sql}
        "#
    );
    let (count, total, total_amil, total_bersih): (i64, i64, i64, i64) = conn.query_row(
        &summary_sql,
        params_from_iter(params.iter()),
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let limit = clamp_limit(req.limit);
    let offset = req.offset.unwrap_or(0);
    let list_sql = format!(
        "{PENERIMAAN_SELECT} {where_sql} ORDER BY p.tanggal DESC, p.created_at DESC LIMIT ? OFFSET ?"
    );
    params.push(SqlValue::Integer(limit as i64));
    params.push(SqlValue::Integer(offset as i64));

    let mut stmt = conn.prepare(&list_sql)?;
    let iter = stmt.query_map(params_from_iter(params.iter()), penerimaan_from_row)?;
    let mut rows = Vec::new();
    for row in iter {
        rows.push(serde_json::to_value(row?).map_err(|e| CoreError::Storage(e.to_string()))?);
    }

    Ok(json!({
        "summary": {
            "count": count,
            "total_cents": total,
            "total_amil_cents": total_amil,
            "total_bersih_cents": total_bersih,
            "limit": limit,
            "offset": offset,
        },
        "rows": rows,
    }))
}

pub fn query_distribusi_at_db_path(
    db_path: &Path,
    req: DistribusiQueryRequest,
) -> CoreResult<Value> {
    let conn = open_connection(db_path)?;
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    period_clauses(&mut clauses, &mut params, "d.tanggal", &req.year, &req.month)?;
    push_opt_filter(&mut clauses, &mut params, "d.mustahiq_id", &req.mustahiq_id);
    push_opt_filter(&mut clauses, &mut params, "a.name", &req.asnaf);
    push_opt_filter(&mut clauses, &mut params, "pr.name", &req.program);
    push_opt_filter(&mut clauses, &mut params, "sp.name", &req.sub_program);

    let where_sql = where_sql(&clauses);
    let summary_sql = format!(
        r#"
        SELECT COUNT(*), COALESCE(SUM(d.jumlah_cents), 0)
        FROM distribusi d
        JOIN reference_entries pr ON pr.id = d.program_id
        JOIN reference_entries sp ON sp.id = d.sub_program_id
        JOIN reference_entries a ON a.id = d.asnaf_id
        {where_sql}
        "#
    );
    let (count, total): (i64, i64) = conn.query_row(
        &summary_sql,
        params_from_iter(params.iter()),
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let limit = clamp_limit(req.limit);
    let offset = req.offset.unwrap_or(0);
    let list_sql = format!(
        "{DISTRIBUSI_SELECT} {where_sql} ORDER BY d.tanggal DESC, d.created_at DESC LIMIT ? OFFSET ?"
    );
    params.push(SqlValue::Integer(limit as i64));
    params.push(SqlValue::Integer(offset as i64));

    let mut stmt = conn.prepare(&list_sql)?;
    let iter = stmt.query_map(params_from_iter(params.iter()), distribusi_from_row)?;
    let mut rows = Vec::new();
    for row in iter {
        rows.push(serde_json::to_value(row?).map_err(|e| CoreError::Storage(e.to_string()))?);
    }

    Ok(json!({
        "summary": {
            "count": count,
            "total_cents": total,
            "limit": limit,
            "offset": offset,
        },
        "rows": rows,
    }))
}

/// Receipt totals grouped along one reporting dimension for a year or a
/// single month.
pub fn penerimaan_stats_at_db_path(db_path: &Path, req: StatsRequest) -> CoreResult<Value> {
    let (name_expr, joins) = match req.dimension.trim() {
        "via" => ("g.name", "JOIN reference_entries g ON g.id = p.via_id"),
        "metode_bayar" => ("g.name", "JOIN reference_entries g ON g.id = p.metode_bayar_id"),
        "jenis_zis" => ("g.name", "JOIN reference_entries g ON g.id = p.jenis_zis_id"),
        "kecamatan" => (
            "g.name",
            "JOIN muzakki mz ON mz.id = p.muzakki_id \
             JOIN reference_entries g ON g.id = mz.kecamatan_id",
        ),
        "jenis_upz" => (
            "COALESCE(g.name, 'Perorangan')",
            "JOIN muzakki mz ON mz.id = p.muzakki_id \
             LEFT JOIN reference_entries g ON g.id = mz.jenis_upz_id",
        ),
        other => {
            return Err(CoreError::validation(format!(
                "dimensi penerimaan tidak dikenal: {other}"
            )))
        }
    };

    let year = year_filter(&req.year)?;
    let month = month_filter(&req.month)?;
    let mut where_sql = "WHERE strftime('%Y', p.tanggal) = ?".to_string();
    let mut params = vec![SqlValue::Text(year.clone())];
    if let Some(month) = &month {
        where_sql.push_str(" AND strftime('%m', p.tanggal) = ?");
        params.push(SqlValue::Text(month.clone()));
    }

    let sql = format!(
        r#"
        SELECT {name_expr} AS category, COUNT(*),
               SUM(p.jumlah_cents), SUM(p.amil_cents), SUM(p.bersih_cents)
        FROM penerimaan p
        {joins}
        {where_sql}
        GROUP BY category
        ORDER BY SUM(p.jumlah_cents) DESC, category ASC
        "#
    );

    let conn = open_connection(db_path)?;
    let mut stmt = conn.prepare(&sql)?;
    let iter = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok(json!({
            "category": row.get::<_, String>(0)?,
            "count": row.get::<_, i64>(1)?,
            "total_cents": row.get::<_, i64>(2)?,
            "total_amil_cents": row.get::<_, i64>(3)?,
            "total_bersih_cents": row.get::<_, i64>(4)?,
        }))
    })?;
    let mut rows = Vec::new();
    let mut grand_count = 0i64;
    let mut grand_total = 0i64;
    for row in iter {
        let row = row?;
        grand_count += row["count"].as_i64().unwrap_or(0);
        grand_total += row["total_cents"].as_i64().unwrap_or(0);
        rows.push(row);
    }

    Ok(json!({
        "summary": {
            "dimension": req.dimension.trim(),
            "year": year,
            "month": month,
            "count": grand_count,
            "total_cents": grand_total,
        },
        "rows": rows,
    }))
}

/// Disbursement totals grouped along one reporting dimension.
pub fn distribusi_stats_at_db_path(db_path: &Path, req: StatsRequest) -> CoreResult<Value> {
    let (name_expr, joins) = match req.dimension.trim() {
        "asnaf" => ("g.name", "JOIN reference_entries g ON g.id = d.asnaf_id"),
        "program" => ("g.name", "JOIN reference_entries g ON g.id = d.program_id"),
        "sub_program" => ("g.name", "JOIN reference_entries g ON g.id = d.sub_program_id"),
        "kecamatan" => (
            "g.name",
            "JOIN mustahiq mt ON mt.id = d.mustahiq_id \
             JOIN reference_entries g ON g.id = mt.kecamatan_id",
        ),
        other => {
            return Err(CoreError::validation(format!(
                "dimensi distribusi tidak dikenal: {other}"
            )))
        }
    };

    let year = year_filter(&req.year)?;
    let month = month_filter(&req.month)?;
    let mut where_sql = "WHERE strftime('%Y', d.tanggal) = ?".to_string();
    let mut params = vec![SqlValue::Text(year.clone())];
    if let Some(month) = &month {
        where_sql.push_str(" AND strftime('%m', d.tanggal) = ?");
        params.push(SqlValue::Text(month.clone()));
    }

    let sql = format!(
        r#"
        SELECT {name_expr} AS category, COUNT(*), SUM(d.jumlah_cents)
        FROM distribusi d
        {joins}
        {where_sql}
        GROUP BY category
        ORDER BY SUM(d.jumlah_cents) DESC, category ASC
        "#
    );

    let conn = open_connection(db_path)?;
    let mut stmt = conn.prepare(&sql)?;
    let iter = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok(json!({
            "category": row.get::<_, String>(0)?,
            "count": row.get::<_, i64>(1)?,
            "total_cents": row.get::<_, i64>(2)?,
        }))
    })?;
    let mut rows = Vec::new();
    let mut grand_count = 0i64;
    let mut grand_total = 0i64;
    for row in iter {
        let row = row?;
        grand_count += row["count"].as_i64().unwrap_or(0);
        grand_total += row["total_cents"].as_i64().unwrap_or(0);
        rows.push(row);
    }

    Ok(json!({
        "summary": {
            "dimension": req.dimension.trim(),
            "year": year,
            "month": month,
            "count": grand_count,
            "total_cents": grand_total,
        },
        "rows": rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_log::Actor;
    use crate::ledger_db::test_support;
    use crate::ledger_mutations::{record_penerimaan_at_db_path, PenerimaanDraft};
    use crate::party_registry::test_fixtures::muzakki_draft;
    use crate::party_registry::{register_party_at_db_path, PartyKind};

    fn actor() -> Actor {
        Actor::new("petugas-1")
    }

    fn seed_receipts(db_path: &std::path::Path) -> String {
        let muzakki = register_party_at_db_path(
            db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.900", "Statistik"),
            &actor(),
        )
        .expect("register");
        for (tanggal, via, metode, jenis, jumlah) in [
            ("2024-01-10", "UPZ", "Transfer", "Zakat Maal", 100_000_00i64),
            ("2024-01-20", "UPZ", "Tunai", "Zakat Fitrah", 50_000_00),
            ("2024-06-05", "Datang Langsung", "Tunai", "Zakat Maal", 75_000_00),
            ("2023-12-31", "Transfer Bank", "Transfer", "Zakat Maal", 25_000_00),
        ] {
            let zis = "Zakat".to_string();
            record_penerimaan_at_db_path(
                db_path,
                &PenerimaanDraft {
                    muzakki_id: muzakki.id.clone(),
                    tanggal: tanggal.to_string(),
                    via: via.to_string(),
                    metode_bayar: metode.to_string(),
                    zis,
                    jenis_zis: jenis.to_string(),
                    jumlah_cents: jumlah,
                    persen_amil: "5".to_string(),
                },
                &actor(),
            )
            .expect("record");
        }
        muzakki.id
    }

    #[test]
    fn month_filter_is_tri_state() {
        assert_eq!(month_filter(&None).unwrap(), None);
        assert_eq!(month_filter(&Some("all".to_string())).unwrap(), None);
        assert_eq!(month_filter(&Some("".to_string())).unwrap(), None);
        assert_eq!(month_filter(&Some("6".to_string())).unwrap(), Some("06".to_string()));
        assert_eq!(month_filter(&Some("12".to_string())).unwrap(), Some("12".to_string()));
        assert!(month_filter(&Some("13".to_string())).is_err());
        assert!(month_filter(&Some("abc".to_string())).is_err());
    }

    #[test]
    fn query_filters_by_period_and_reference() {
        let db_path = test_support::migrated_temp_db("simzis_stats_query_test");
        seed_receipts(&db_path);

        // Whole year 2024.
        let year = query_penerimaan_at_db_path(
            &db_path,
            PenerimaanQueryRequest {
                year: Some("2024".to_string()),
                ..Default::default()
            },
        )
        .expect("year query");
        assert_eq!(year["summary"]["count"], 3);
        assert_eq!(year["summary"]["total_cents"], 225_000_00i64);

        // January only.
        let january = query_penerimaan_at_db_path(
            &db_path,
            PenerimaanQueryRequest {
                year: Some("2024".to_string()),
                month: Some("1".to_string()),
                ..Default::default()
            },
        )
        .expect("month query");
        assert_eq!(january["summary"]["count"], 2);
        assert_eq!(january["summary"]["total_cents"], 150_000_00i64);

        // "all" behaves exactly like an absent month.
        let all = query_penerimaan_at_db_path(
            &db_path,
            PenerimaanQueryRequest {
                year: Some("2024".to_string()),
                month: Some("all".to_string()),
                ..Default::default()
            },
        )
        .expect("all query");
        assert_eq!(all["summary"], year["summary"]);

        let via = query_penerimaan_at_db_path(
            &db_path,
            PenerimaanQueryRequest {
                year: Some("2024".to_string()),
                via: Some("UPZ".to_string()),
                ..Default::default()
            },
        )
        .expect("via query");
        assert_eq!(via["summary"]["count"], 2);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn stats_group_by_dimension() {
        let db_path = test_support::migrated_temp_db("simzis_stats_group_test");
        seed_receipts(&db_path);

        let by_via = penerimaan_stats_at_db_path(
            &db_path,
            StatsRequest {
                dimension: "via".to_string(),
                year: "2024".to_string(),
                month: None,
            },
        )
        .expect("stats");
        let rows = by_via["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 2);
        // Ordered by total descending: UPZ 150k beats Datang Langsung 75k.
        assert_eq!(rows[0]["category"], "UPZ");
        assert_eq!(rows[0]["total_cents"], 150_000_00i64);
        assert_eq!(rows[1]["category"], "Datang Langsung");
        assert_eq!(by_via["summary"]["count"], 3);
        assert_eq!(by_via["summary"]["total_cents"], 225_000_00i64);

        // Every fixture muzakki lives in Banjarbaru Utara.
        let by_kecamatan = penerimaan_stats_at_db_path(
            &db_path,
            StatsRequest {
                dimension: "kecamatan".to_string(),
                year: "2024".to_string(),
                month: None,
            },
        )
        .expect("stats");
        let rows = by_kecamatan["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["category"], "Banjarbaru Utara");

        let unknown = penerimaan_stats_at_db_path(
            &db_path,
            StatsRequest {
                dimension: "warna".to_string(),
                year: "2024".to_string(),
                month: None,
            },
        );
        assert!(matches!(unknown, Err(CoreError::Validation(_))));

        let _ = std::fs::remove_file(&db_path);
    }
}
