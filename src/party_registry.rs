use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

use crate::audit_log::{record_audit, Actor, AuditAction};
use crate::catalog::{self, RefCategory};
use crate::error::{CoreError, CoreResult};
use crate::ledger_db::open_connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyKind {
    Muzakki,
    Mustahiq,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Muzakki => "muzakki",
            PartyKind::Mustahiq => "mustahiq",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        self.as_str()
    }

    pub(crate) fn ledger_table(&self) -> &'static str {
        match self {
            PartyKind::Muzakki => "penerimaan",
            PartyKind::Mustahiq => "distribusi",
        }
    }

    pub(crate) fn ledger_fk(&self) -> &'static str {
        match self {
            PartyKind::Muzakki => "muzakki_id",
            PartyKind::Mustahiq => "mustahiq_id",
        }
    }

    fn extra_column(&self) -> &'static str {
        match self {
            PartyKind::Muzakki => "jenis_upz_id",
            PartyKind::Mustahiq => "asnaf_id",
        }
    }

    fn allowed_statuses(&self) -> &'static [&'static str] {
        match self {
            PartyKind::Muzakki => &["aktif", "nonaktif"],
            PartyKind::Mustahiq => &["aktif", "nonaktif", "blacklist"],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartyDraft {
    pub no_registrasi: String,
    pub nik: Option<String>,
    pub nama: String,
    pub telepon: Option<String>,
    pub alamat: Option<String>,
    pub kecamatan: String,
    pub kelurahan: String,
    /// Muzakki only: institutional collection-unit type.
    pub jenis_upz: Option<String>,
    /// Mustahiq only: beneficiary class, required.
    pub asnaf: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Party {
    pub id: String,
    pub no_registrasi: String,
    pub nik: Option<String>,
    pub nama: String,
    pub telepon: Option<String>,
    pub alamat: Option<String>,
    pub kecamatan: String,
    pub kelurahan: String,
    pub jenis_upz: Option<String>,
    pub asnaf: Option<String>,
    pub status: String,
    pub jumlah_transaksi: i64,
    pub total_cents: i64,
    pub tanggal_terakhir: Option<String>,
    pub registered_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchPartiesRequest {
    pub query: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SearchPartiesPage {
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub rows: Vec<Party>,
}

#[derive(Debug, Serialize)]
pub struct PartyDriftRow {
    pub party_id: String,
    pub no_registrasi: String,
    pub stored_count: i64,
    pub stored_total_cents: i64,
    pub computed_count: i64,
    pub computed_total_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct ReconcileResult {
    pub kind: String,
    pub checked: usize,
    pub drifted: Vec<PartyDriftRow>,
}

fn nik_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[0-9]{16}$").expect("nik regex"))
}

fn registration_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9./-]{0,31}$").expect("reg regex"))
}

fn clean_optional(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

struct NormalizedDraft {
    no_registrasi: String,
    nik: Option<String>,
    nama: String,
    telepon: Option<String>,
    alamat: Option<String>,
    kecamatan_id: String,
    kelurahan_id: String,
    extra_id: Option<String>,
}

fn normalize_draft(conn: &Connection, kind: PartyKind, draft: &PartyDraft) -> CoreResult<NormalizedDraft> {
    let no_registrasi = draft.no_registrasi.trim().to_string();
    if no_registrasi.is_empty() {
        return Err(CoreError::validation("no_registrasi wajib diisi"));
    }
    if !registration_regex().is_match(&no_registrasi) {
        return Err(CoreError::validation(format!(
            "format no_registrasi tidak valid: {no_registrasi}"
        )));
    }
    let nama = draft.nama.trim().to_string();
    if nama.is_empty() {
        return Err(CoreError::validation("nama wajib diisi"));
    }
    let nik = clean_optional(&draft.nik);
    if let Some(nik) = &nik {
        if !nik_regex().is_match(nik) {
            return Err(CoreError::validation(format!(
                "NIK harus 16 digit angka: {nik}"
            )));
        }
    }

    let kecamatan = draft.kecamatan.trim();
    let kelurahan = draft.kelurahan.trim();
    if kecamatan.is_empty() || kelurahan.is_empty() {
        return Err(CoreError::validation("kecamatan dan kelurahan wajib diisi"));
    }
    let kecamatan_entry = catalog::resolve(conn, RefCategory::Kecamatan, kecamatan)?;
    let kelurahan_entry = catalog::resolve_child(conn, RefCategory::Kelurahan, kelurahan, kecamatan)?;

    let extra_id = match kind {
        PartyKind::Muzakki => match clean_optional(&draft.jenis_upz) {
            Some(name) => Some(catalog::resolve(conn, RefCategory::JenisUpz, &name)?.id),
            None => None,
        },
        PartyKind::Mustahiq => {
            let name = clean_optional(&draft.asnaf)
                .ok_or_else(|| CoreError::validation("asnaf wajib diisi untuk mustahiq"))?;
            Some(catalog::resolve(conn, RefCategory::Asnaf, &name)?.id)
        }
    };

    Ok(NormalizedDraft {
        no_registrasi,
        nik,
        nama,
        telepon: clean_optional(&draft.telepon),
        alamat: clean_optional(&draft.alamat),
        kecamatan_id: kecamatan_entry.id,
        kelurahan_id: kelurahan_entry.id,
        extra_id,
    })
}

fn check_identity_unique(
    conn: &Connection,
    kind: PartyKind,
    no_registrasi: &str,
    nik: Option<&str>,
    exclude_id: Option<&str>,
) -> CoreResult<()> {
    let table = kind.table();
    let exclude = exclude_id.unwrap_or("");
    let reg_taken: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {table} WHERE no_registrasi = ?1 AND id != ?2"),
            params![no_registrasi, exclude],
            |row| row.get(0),
        )
        .optional()?;
    if reg_taken.is_some() {
        return Err(CoreError::DuplicateIdentity(format!(
            "no_registrasi sudah terdaftar: {no_registrasi}"
        )));
    }
    if let Some(nik) = nik {
        let nik_taken: Option<String> = conn
            .query_row(
                &format!("SELECT id FROM {table} WHERE nik = ?1 AND id != ?2"),
                params![nik, exclude],
                |row| row.get(0),
            )
            .optional()?;
        if nik_taken.is_some() {
            return Err(CoreError::DuplicateIdentity(format!(
                "NIK sudah terdaftar: {nik}"
            )));
        }
    }
    Ok(())
}

fn party_select_sql(kind: PartyKind, where_sql: &str, tail_sql: &str) -> String {
    format!(
        r#"
        SELECT p.id, p.no_registrasi, p.nik, p.nama, p.telepon, p.alamat,
               kc.name AS kecamatan, kl.name AS kelurahan, x.name AS extra,
               p.status, p.jumlah_transaksi, p.total_cents, p.tanggal_terakhir,
               p.registered_by, p.created_at, p.updated_at
        FROM {table} p
        JOIN reference_entries kc ON kc.id = p.kecamatan_id
        JOIN reference_entries kl ON kl.id = p.kelurahan_id
        LEFT JOIN reference_entries x ON x.id = p.{extra}
        {where_sql}
        {tail_sql}
        "#,
        table = kind.table(),
        extra = kind.extra_column(),
    )
}

fn party_from_row(kind: PartyKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<Party> {
    let extra: Option<String> = row.get(8)?;
    let (jenis_upz, asnaf) = match kind {
        PartyKind::Muzakki => (extra, None),
        PartyKind::Mustahiq => (None, extra),
    };
    Ok(Party {
        id: row.get(0)?,
        no_registrasi: row.get(1)?,
        nik: row.get(2)?,
        nama: row.get(3)?,
        telepon: row.get(4)?,
        alamat: row.get(5)?,
        kecamatan: row.get(6)?,
        kelurahan: row.get(7)?,
        jenis_upz,
        asnaf,
        status: row.get(9)?,
        jumlah_transaksi: row.get(10)?,
        total_cents: row.get(11)?,
        tanggal_terakhir: row.get(12)?,
        registered_by: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub(crate) fn load_party(conn: &Connection, kind: PartyKind, id: &str) -> CoreResult<Party> {
    let sql = party_select_sql(kind, "WHERE p.id = ?1", "");
    conn.query_row(&sql, [id], |row| party_from_row(kind, row))
        .optional()?
        .ok_or_else(|| {
            CoreError::validation(format!("{} tidak ditemukan: {id}", kind.as_str()))
        })
}

pub(crate) fn find_party_id_by_registration(
    conn: &Connection,
    kind: PartyKind,
    no_registrasi: &str,
) -> CoreResult<Option<String>> {
    let sql = format!(
        "SELECT id FROM {} WHERE no_registrasi = ?1",
        kind.table()
    );
    Ok(conn.query_row(&sql, [no_registrasi], |row| row.get(0)).optional()?)
}

/// Registers a new party. Uniqueness checks, catalog resolution, the insert
/// and the audit record all run inside one transaction.
pub fn register_party_at_db_path(
    db_path: &Path,
    kind: PartyKind,
    draft: &PartyDraft,
    actor: &Actor,
) -> CoreResult<Party> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let party = register_party_tx(&tx, kind, draft, actor)?;
    tx.commit()?;
    Ok(party)
}

pub(crate) fn register_party_tx(
    conn: &Connection,
    kind: PartyKind,
    draft: &PartyDraft,
    actor: &Actor,
) -> CoreResult<Party> {
    let normalized = normalize_draft(conn, kind, draft)?;
    check_identity_unique(
        conn,
        kind,
        &normalized.no_registrasi,
        normalized.nik.as_deref(),
        None,
    )?;

    let id = uuid::Uuid::new_v4().to_string();
    let sql = format!(
        r#"
        INSERT INTO {table}(id, no_registrasi, nik, nama, telepon, alamat,
                            kecamatan_id, kelurahan_id, {extra}, status, registered_by)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'aktif', ?10)
        "#,
        table = kind.table(),
        extra = kind.extra_column(),
    );
    conn.execute(
        &sql,
        params![
            id,
            normalized.no_registrasi,
            normalized.nik,
            normalized.nama,
            normalized.telepon,
            normalized.alamat,
            normalized.kecamatan_id,
            normalized.kelurahan_id,
            normalized.extra_id,
            actor.user_id,
        ],
    )?;

    let party = load_party(conn, kind, &id)?;
    let after = serde_json::to_value(&party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    record_audit(conn, kind.table(), AuditAction::Insert, None, Some(&after), actor)?;
    Ok(party)
}

/// Overwrites identity/contact/reference fields. Aggregates are derived and
/// cannot be patched through this path.
pub fn update_party_at_db_path(
    db_path: &Path,
    kind: PartyKind,
    id: &str,
    draft: &PartyDraft,
    actor: &Actor,
) -> CoreResult<Party> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let party = update_party_tx(&tx, kind, id, draft, actor)?;
    tx.commit()?;
    Ok(party)
}

pub(crate) fn update_party_tx(
    conn: &Connection,
    kind: PartyKind,
    id: &str,
    draft: &PartyDraft,
    actor: &Actor,
) -> CoreResult<Party> {
    let before_party = load_party(conn, kind, id)?;
    let normalized = normalize_draft(conn, kind, draft)?;
    check_identity_unique(
        conn,
        kind,
        &normalized.no_registrasi,
        normalized.nik.as_deref(),
        Some(id),
    )?;

    let sql = format!(
        r#"
        UPDATE {table}
        SET no_registrasi = ?1, nik = ?2, nama = ?3, telepon = ?4, alamat = ?5,
            kecamatan_id = ?6, kelurahan_id = ?7, {extra} = ?8,
            updated_at = datetime('now')
        WHERE id = ?9
        "#,
        table = kind.table(),
        extra = kind.extra_column(),
    );
    conn.execute(
        &sql,
        params![
            normalized.no_registrasi,
            normalized.nik,
            normalized.nama,
            normalized.telepon,
            normalized.alamat,
            normalized.kecamatan_id,
            normalized.kelurahan_id,
            normalized.extra_id,
            id,
        ],
    )?;

    let party = load_party(conn, kind, id)?;
    let before = serde_json::to_value(&before_party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    let after = serde_json::to_value(&party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    record_audit(
        conn,
        kind.table(),
        AuditAction::Update,
        Some(&before),
        Some(&after),
        actor,
    )?;
    Ok(party)
}

/// Logical retirement: parties are never hard-deleted while referenced, only
/// flipped between statuses.
pub fn set_party_status_at_db_path(
    db_path: &Path,
    kind: PartyKind,
    id: &str,
    status: &str,
    actor: &Actor,
) -> CoreResult<Party> {
    let status = status.trim().to_lowercase();
    if !kind.allowed_statuses().contains(&status.as_str()) {
        return Err(CoreError::validation(format!(
            "status {} hanya mendukung: {}",
            kind.as_str(),
            kind.allowed_statuses().join(", ")
        )));
    }

    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let before_party = load_party(&tx, kind, id)?;
    tx.execute(
        &format!(
            "UPDATE {} SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            kind.table()
        ),
        params![status, id],
    )?;
    let party = load_party(&tx, kind, id)?;
    let before = serde_json::to_value(&before_party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    let after = serde_json::to_value(&party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    record_audit(
        &tx,
        kind.table(),
        AuditAction::Update,
        Some(&before),
        Some(&after),
        actor,
    )?;
    tx.commit()?;
    Ok(party)
}

/// Hard delete, only when no ledger rows reference the party.
pub fn delete_party_at_db_path(
    db_path: &Path,
    kind: PartyKind,
    id: &str,
    actor: &Actor,
) -> CoreResult<Party> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let party = load_party(&tx, kind, id)?;

    let referencing: i64 = tx.query_row(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            kind.ledger_table(),
            kind.ledger_fk()
        ),
        [id],
        |row| row.get(0),
    )?;
    if referencing > 0 {
        return Err(CoreError::ReferentialRestrict(format!(
            "{} masih memiliki {referencing} transaksi di {}",
            kind.as_str(),
            kind.ledger_table()
        )));
    }

    tx.execute(
        &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
        [id],
    )?;
    let before = serde_json::to_value(&party)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))?;
    record_audit(&tx, kind.table(), AuditAction::Delete, Some(&before), None, actor)?;
    tx.commit()?;
    Ok(party)
}

/// Applies one ledger event to the party aggregates as a single storage-side
/// read-modify-write; never read-then-write from the application.
pub(crate) fn apply_ledger_event(
    conn: &Connection,
    kind: PartyKind,
    party_id: &str,
    amount_cents: i64,
    tanggal: &str,
) -> CoreResult<()> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET jumlah_transaksi = jumlah_transaksi + 1,
            total_cents = total_cents + ?1,
            tanggal_terakhir = CASE
                WHEN tanggal_terakhir IS NULL OR tanggal_terakhir < ?2 THEN ?2
                ELSE tanggal_terakhir
            END,
            updated_at = datetime('now')
        WHERE id = ?3
        "#,
        table = kind.table(),
    );
    let changed = conn.execute(&sql, params![amount_cents, tanggal, party_id])?;
    if changed == 0 {
        return Err(CoreError::validation(format!(
            "{} tidak ditemukan: {party_id}",
            kind.as_str()
        )));
    }
    Ok(())
}

/// Reverses one ledger event: subtract count/total, recompute the last event
/// date from the rows that remain. Call after the ledger row was removed or
/// re-pointed.
pub(crate) fn reverse_ledger_event(
    conn: &Connection,
    kind: PartyKind,
    party_id: &str,
    amount_cents: i64,
) -> CoreResult<()> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET jumlah_transaksi = jumlah_transaksi - 1,
            total_cents = total_cents - ?1,
            tanggal_terakhir = (
                SELECT MAX(tanggal) FROM {ledger} WHERE {fk} = {table}.id
            ),
            updated_at = datetime('now')
        WHERE id = ?2
        "#,
        table = kind.table(),
        ledger = kind.ledger_table(),
        fk = kind.ledger_fk(),
    );
    let changed = conn.execute(&sql, params![amount_cents, party_id])?;
    if changed == 0 {
        return Err(CoreError::validation(format!(
            "{} tidak ditemukan: {party_id}",
            kind.as_str()
        )));
    }
    Ok(())
}

/// Substring match on nama, exact match on no_registrasi/NIK. Exact identity
/// hits sort first, then exact name, then the rest by name.
pub fn search_parties_at_db_path(
    db_path: &Path,
    kind: PartyKind,
    req: SearchPartiesRequest,
) -> CoreResult<SearchPartiesPage> {
    let query = req.query.unwrap_or_default().trim().to_string();
    let page = req.page.unwrap_or(1).max(1);
    let page_size = req.page_size.unwrap_or(20).clamp(1, 200);
    // i64 arithmetic: the page number arrives unchecked from callers.
    let offset = (page as i64 - 1) * page_size as i64;

    let conn = open_connection(db_path)?;

    let (where_sql, mut params): (String, Vec<SqlValue>) = if query.is_empty() {
        (String::new(), Vec::new())
    } else {
        (
            "WHERE p.no_registrasi = ? OR p.nik = ? OR p.nama LIKE ?".to_string(),
            vec![
                SqlValue::Text(query.clone()),
                SqlValue::Text(query.clone()),
                SqlValue::Text(format!("%{query}%")),
            ],
        )
    };

    let count_sql = format!(
        "SELECT COUNT(*) FROM {} p {}",
        kind.table(),
        where_sql
    );
    let total: i64 = conn.query_row(&count_sql, params_from_iter(params.iter()), |row| row.get(0))?;

    let order_sql = if query.is_empty() {
        "ORDER BY p.nama ASC, p.id ASC LIMIT ? OFFSET ?".to_string()
    } else {
        // The CASE placeholders bind after the WHERE placeholders.
        params.push(SqlValue::Text(query.clone()));
        params.push(SqlValue::Text(query.clone()));
        params.push(SqlValue::Text(query.clone()));
        "ORDER BY CASE
             WHEN p.no_registrasi = ? OR p.nik = ? THEN 0
             WHEN p.nama = ? THEN 1
             ELSE 2
         END, p.nama ASC, p.id ASC
         LIMIT ? OFFSET ?"
            .to_string()
    };

    let sql = party_select_sql(kind, &where_sql, &order_sql);
    params.push(SqlValue::Integer(page_size as i64));
    params.push(SqlValue::Integer(offset));

    let mut stmt = conn.prepare(&sql)?;
    let iter = stmt.query_map(params_from_iter(params.iter()), |row| {
        party_from_row(kind, row)
    })?;
    let mut rows = Vec::new();
    for row in iter {
        rows.push(row?);
    }

    Ok(SearchPartiesPage {
        total,
        page,
        page_size,
        rows,
    })
}

/// Full recompute of every party's aggregates from the ledger. Incremental
/// maintenance accumulates drift over delete/update cycles; an external
/// scheduler should run this periodically (nightly is the recommendation).
pub fn reconcile_party_aggregates_at_db_path(
    db_path: &Path,
    kind: PartyKind,
) -> CoreResult<ReconcileResult> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;

    let sql = format!(
        r#"
        SELECT p.id, p.no_registrasi, p.jumlah_transaksi, p.total_cents, p.tanggal_terakhir,
               COUNT(l.id), COALESCE(SUM(l.jumlah_cents), 0), MAX(l.tanggal)
        FROM {table} p
        LEFT JOIN {ledger} l ON l.{fk} = p.id
        GROUP BY p.id
        "#,
        table = kind.table(),
        ledger = kind.ledger_table(),
        fk = kind.ledger_fk(),
    );

    struct Row {
        id: String,
        no_registrasi: String,
        stored_count: i64,
        stored_total: i64,
        stored_last: Option<String>,
        computed_count: i64,
        computed_total: i64,
        computed_last: Option<String>,
    }

    let mut checked = 0usize;
    let mut drifted_rows = Vec::new();
    {
        let mut stmt = tx.prepare(&sql)?;
        let iter = stmt.query_map([], |row| {
            Ok(Row {
                id: row.get(0)?,
                no_registrasi: row.get(1)?,
                stored_count: row.get(2)?,
                stored_total: row.get(3)?,
                stored_last: row.get(4)?,
                computed_count: row.get(5)?,
                computed_total: row.get(6)?,
                computed_last: row.get(7)?,
            })
        })?;
        for row in iter {
            let row = row?;
            checked += 1;
            if row.stored_count != row.computed_count
                || row.stored_total != row.computed_total
                || row.stored_last != row.computed_last
            {
                drifted_rows.push(row);
            }
        }
    }

    let mut report = Vec::new();
    for row in &drifted_rows {
        tx.execute(
            &format!(
                r#"
                UPDATE {table}
                SET jumlah_transaksi = ?1, total_cents = ?2, tanggal_terakhir = ?3,
                    updated_at = datetime('now')
                WHERE id = ?4
                "#,
                table = kind.table(),
            ),
            params![row.computed_count, row.computed_total, row.computed_last, row.id],
        )?;
        log::info!(
            "aggregate drift fixed for {} {}: count {}->{}, total {}->{}",
            kind.as_str(),
            row.no_registrasi,
            row.stored_count,
            row.computed_count,
            row.stored_total,
            row.computed_total
        );
        report.push(PartyDriftRow {
            party_id: row.id.clone(),
            no_registrasi: row.no_registrasi.clone(),
            stored_count: row.stored_count,
            stored_total_cents: row.stored_total,
            computed_count: row.computed_count,
            computed_total_cents: row.computed_total,
        });
    }
    tx.commit()?;

    Ok(ReconcileResult {
        kind: kind.as_str().to_string(),
        checked,
        drifted: report,
    })
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{mustahiq_draft, muzakki_draft};
    use super::*;
    use crate::ledger_db::test_support;

    fn actor() -> Actor {
        Actor::new("petugas-1")
    }

    #[test]
    fn register_validates_uniqueness_and_references() {
        let db_path = test_support::migrated_temp_db("simzis_party_register_test");

        let party = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.001", "Ahmad Fauzi"),
            &actor(),
        )
        .expect("register");
        assert_eq!(party.status, "aktif");
        assert_eq!(party.jumlah_transaksi, 0);
        assert_eq!(party.kelurahan, "Mentaos");
        assert_eq!(party.registered_by.as_deref(), Some("petugas-1"));

        let dup = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.001", "Orang Lain"),
            &actor(),
        );
        assert!(matches!(dup, Err(CoreError::DuplicateIdentity(_))));

        let mut bad_region = muzakki_draft("MZ.002", "Siti Aminah");
        bad_region.kelurahan = "Palam".to_string(); // belongs to Cempaka
        let mismatch =
            register_party_at_db_path(&db_path, PartyKind::Muzakki, &bad_region, &actor());
        assert!(matches!(mismatch, Err(CoreError::InvalidHierarchy(_))));

        let mut unknown_region = muzakki_draft("MZ.003", "Budi");
        unknown_region.kecamatan = "Antah Berantah".to_string();
        let unresolved =
            register_party_at_db_path(&db_path, PartyKind::Muzakki, &unknown_region, &actor());
        assert!(matches!(
            unresolved,
            Err(CoreError::UnresolvedReference { .. })
        ));

        let mut bad_nik = muzakki_draft("MZ.004", "Rahmat");
        bad_nik.nik = Some("12345".to_string());
        let invalid = register_party_at_db_path(&db_path, PartyKind::Muzakki, &bad_nik, &actor());
        assert!(matches!(invalid, Err(CoreError::Validation(_))));

        let mustahiq_without_asnaf = PartyDraft {
            asnaf: None,
            ..mustahiq_draft("MT.001", "Halimah")
        };
        let missing = register_party_at_db_path(
            &db_path,
            PartyKind::Mustahiq,
            &mustahiq_without_asnaf,
            &actor(),
        );
        assert!(matches!(missing, Err(CoreError::Validation(_))));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn unique_constraint_race_surfaces_as_duplicate_identity() {
        let db_path = test_support::migrated_temp_db("simzis_party_unique_race_test");
        register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.005", "Asli"),
            &actor(),
        )
        .expect("register");

        // A writer that slipped past the pre-insert check hits the UNIQUE
        // index directly; the storage error must map to DuplicateIdentity.
        let conn = open_connection(&db_path).expect("open");
        let (kecamatan_id, kelurahan_id): (String, String) = conn
            .query_row(
                "SELECT kecamatan_id, kelurahan_id FROM muzakki WHERE no_registrasi = 'MZ.005'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("ids");
        let raw = conn.execute(
            r#"
            INSERT INTO muzakki(id, no_registrasi, nama, kecamatan_id, kelurahan_id)
            VALUES (?1, 'MZ.005', 'Penyusup', ?2, ?3)
            "#,
            params![uuid::Uuid::new_v4().to_string(), kecamatan_id, kelurahan_id],
        );
        let mapped: CoreError = raw.expect_err("unique violation").into();
        assert!(matches!(mapped, CoreError::DuplicateIdentity(_)));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn failed_register_leaves_no_partial_state() {
        let db_path = test_support::migrated_temp_db("simzis_party_atomic_test");
        let mut bad = muzakki_draft("MZ.100", "Gagal");
        bad.kecamatan = "Tidak Ada".to_string();
        let _ = register_party_at_db_path(&db_path, PartyKind::Muzakki, &bad, &actor());

        let conn = open_connection(&db_path).expect("open");
        let parties: i64 = conn
            .query_row("SELECT COUNT(*) FROM muzakki", [], |r| r.get(0))
            .expect("count");
        let audits: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_records", [], |r| r.get(0))
            .expect("count");
        assert_eq!(parties, 0);
        assert_eq!(audits, 0, "no audit row without a persisted mutation");

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn ledger_events_increment_and_reverse_aggregates() {
        let db_path = test_support::migrated_temp_db("simzis_party_events_test");
        let party = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.010", "Hasan"),
            &actor(),
        )
        .expect("register");

        let conn = open_connection(&db_path).expect("open");
        apply_ledger_event(&conn, PartyKind::Muzakki, &party.id, 50_000_00, "2024-03-01")
            .expect("event 1");
        apply_ledger_event(&conn, PartyKind::Muzakki, &party.id, 25_000_00, "2024-01-15")
            .expect("event 2");

        let loaded = load_party(&conn, PartyKind::Muzakki, &party.id).expect("load");
        assert_eq!(loaded.jumlah_transaksi, 2);
        assert_eq!(loaded.total_cents, 75_000_00);
        // Older event must not move the last-event date backwards.
        assert_eq!(loaded.tanggal_terakhir.as_deref(), Some("2024-03-01"));

        reverse_ledger_event(&conn, PartyKind::Muzakki, &party.id, 25_000_00).expect("reverse");
        let reversed = load_party(&conn, PartyKind::Muzakki, &party.id).expect("load");
        assert_eq!(reversed.jumlah_transaksi, 1);
        assert_eq!(reversed.total_cents, 50_000_00);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn concurrent_ledger_events_lose_no_increments() {
        let db_path = test_support::migrated_temp_db("simzis_party_concurrent_test");
        let party = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.011", "Serentak"),
            &actor(),
        )
        .expect("register");

        const WRITERS: usize = 8;
        const EVENTS_PER_WRITER: usize = 25;
        std::thread::scope(|scope| {
            for _ in 0..WRITERS {
                let db_path = &db_path;
                let party_id = party.id.as_str();
                scope.spawn(move || {
                    let conn = open_connection(db_path).expect("open");
                    for n in 0..EVENTS_PER_WRITER {
                        apply_ledger_event(
                            &conn,
                            PartyKind::Muzakki,
                            party_id,
                            1_000,
                            &format!("2024-08-{:02}", (n % 28) + 1),
                        )
                        .expect("event");
                    }
                });
            }
        });

        let conn = open_connection(&db_path).expect("open");
        let loaded = load_party(&conn, PartyKind::Muzakki, &party.id).expect("load");
        assert_eq!(loaded.jumlah_transaksi, (WRITERS * EVENTS_PER_WRITER) as i64);
        assert_eq!(loaded.total_cents, (WRITERS * EVENTS_PER_WRITER) as i64 * 1_000);
        assert_eq!(loaded.tanggal_terakhir.as_deref(), Some("2024-08-25"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn search_orders_by_relevance_and_paginates() {
        let db_path = test_support::migrated_temp_db("simzis_party_search_test");
        for (reg, nama) in [
            ("MZ.201", "Abdul Karim"),
            ("MZ.202", "Karim"),
            ("MZ.203", "Karimah Putri"),
            ("Karim", "Zainal"),
        ] {
            register_party_at_db_path(
                &db_path,
                PartyKind::Muzakki,
                &muzakki_draft(reg, nama),
                &actor(),
            )
            .expect("register");
        }

        let page = search_parties_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            SearchPartiesRequest {
                query: Some("Karim".to_string()),
                page: None,
                page_size: None,
            },
        )
        .expect("search");
        assert_eq!(page.total, 4);
        // Exact registration number first, exact name second.
        assert_eq!(page.rows[0].no_registrasi, "Karim");
        assert_eq!(page.rows[1].nama, "Karim");

        let first = search_parties_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            SearchPartiesRequest {
                query: None,
                page: Some(1),
                page_size: Some(3),
            },
        )
        .expect("page 1");
        let second = search_parties_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            SearchPartiesRequest {
                query: None,
                page: Some(2),
                page_size: Some(3),
            },
        )
        .expect("page 2");
        assert_eq!(first.rows.len(), 3);
        assert_eq!(second.rows.len(), 1);
        let mut seen: Vec<String> = first.rows.iter().map(|p| p.id.clone()).collect();
        seen.extend(second.rows.iter().map(|p| p.id.clone()));
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4, "no duplicates or gaps across pages");

        // A page number far past the data returns an empty page, never an
        // arithmetic overflow.
        let far = search_parties_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            SearchPartiesRequest {
                query: None,
                page: Some(u32::MAX),
                page_size: Some(200),
            },
        )
        .expect("out-of-range page");
        assert_eq!(far.total, 4);
        assert!(far.rows.is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn status_transitions_respect_party_kind() {
        let db_path = test_support::migrated_temp_db("simzis_party_status_test");
        let muzakki = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.301", "Umar"),
            &actor(),
        )
        .expect("register muzakki");
        let mustahiq = register_party_at_db_path(
            &db_path,
            PartyKind::Mustahiq,
            &mustahiq_draft("MT.301", "Fatimah"),
            &actor(),
        )
        .expect("register mustahiq");

        let retired =
            set_party_status_at_db_path(&db_path, PartyKind::Muzakki, &muzakki.id, "nonaktif", &actor())
                .expect("retire");
        assert_eq!(retired.status, "nonaktif");

        let blacklist_muzakki =
            set_party_status_at_db_path(&db_path, PartyKind::Muzakki, &muzakki.id, "blacklist", &actor());
        assert!(matches!(blacklist_muzakki, Err(CoreError::Validation(_))));

        let blacklisted = set_party_status_at_db_path(
            &db_path,
            PartyKind::Mustahiq,
            &mustahiq.id,
            "blacklist",
            &actor(),
        )
        .expect("blacklist mustahiq");
        assert_eq!(blacklisted.status, "blacklist");

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn delete_writes_audit_and_reconcile_fixes_drift() {
        let db_path = test_support::migrated_temp_db("simzis_party_reconcile_test");
        let party = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.401", "Yusuf"),
            &actor(),
        )
        .expect("register");

        // Tamper with the derived aggregates directly.
        let conn = open_connection(&db_path).expect("open");
        conn.execute(
            "UPDATE muzakki SET jumlah_transaksi = 9, total_cents = 123456 WHERE id = ?1",
            [&party.id],
        )
        .expect("tamper");

        let result =
            reconcile_party_aggregates_at_db_path(&db_path, PartyKind::Muzakki).expect("reconcile");
        assert_eq!(result.checked, 1);
        assert_eq!(result.drifted.len(), 1);
        assert_eq!(result.drifted[0].computed_count, 0);
        let fixed = load_party(&conn, PartyKind::Muzakki, &party.id).expect("load");
        assert_eq!(fixed.jumlah_transaksi, 0);
        assert_eq!(fixed.total_cents, 0);

        let deleted =
            delete_party_at_db_path(&db_path, PartyKind::Muzakki, &party.id, &actor()).expect("delete");
        assert_eq!(deleted.id, party.id);
        let audit_deletes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_records WHERE table_name = 'muzakki' AND action = 'DELETE'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(audit_deletes, 1);

        let _ = std::fs::remove_file(&db_path);
    }
}
