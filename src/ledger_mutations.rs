use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::allocation::{allocate, parse_amil_rate_bp};
use crate::audit_log::{record_audit, Actor, AuditAction};
use crate::catalog::{self, RefCategory};
use crate::error::{CoreError, CoreResult};
use crate::ledger_db::open_connection;
use crate::party_registry::{apply_ledger_event, load_party, reverse_ledger_event, PartyKind};

/// Earliest date the organisation accepts on a ledger row.
const LEDGER_EPOCH: (i32, u32, u32) = (2001, 1, 1);

/// Parses a date in `YYYY-MM-DD`, `DD/MM/YYYY` or `DD-MM-YYYY` form and
/// rejects anything outside 2001-01-01 through today (UTC). Returns the
/// ISO form used for storage and sorting.
pub(crate) fn normalize_date_strict(raw: &str) -> CoreResult<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(CoreError::validation("tanggal wajib diisi"));
    }
    let parsed = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(text, "%d-%m-%Y"))
        .map_err(|_| CoreError::validation(format!("format tanggal tidak dikenal: {text}")))?;

    let (ey, em, ed) = LEDGER_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(ey, em, ed).expect("valid epoch");
    let today = Utc::now().date_naive();
    if parsed < epoch || parsed > today {
        return Err(CoreError::validation(format!(
            "tanggal di luar rentang yang diizinkan: {text}"
        )));
    }
    Ok(parsed.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PenerimaanDraft {
    pub muzakki_id: String,
    pub tanggal: String,
    pub via: String,
    pub metode_bayar: String,
    pub zis: String,
    pub jenis_zis: String,
    pub jumlah_cents: i64,
    /// Human form, e.g. `"12.5"` or `"12,5%"`.
    pub persen_amil: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Penerimaan {
    pub id: String,
    pub muzakki_id: String,
    pub nama_muzakki: String,
    pub telepon_muzakki: Option<String>,
    pub tanggal: String,
    pub via: String,
    pub metode_bayar: String,
    pub jenis_zis: String,
    pub jumlah_cents: i64,
    pub persen_amil_bp: i64,
    pub amil_cents: i64,
    pub bersih_cents: i64,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistribusiDraft {
    pub mustahiq_id: String,
    pub tanggal: String,
    pub program: String,
    pub sub_program: String,
    /// Defaults to the mustahiq's own asnaf when omitted.
    pub asnaf: Option<String>,
    pub jumlah_cents: i64,
    pub keterangan: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Distribusi {
    pub id: String,
    pub mustahiq_id: String,
    pub nama_mustahiq: String,
    pub tanggal: String,
    pub program: String,
    pub sub_program: String,
    pub asnaf: String,
    pub jumlah_cents: i64,
    pub keterangan: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) struct PreparedPenerimaan {
    pub muzakki_id: String,
    pub nama_muzakki: String,
    pub telepon_muzakki: Option<String>,
    pub tanggal: String,
    pub via_id: String,
    pub metode_bayar_id: String,
    pub jenis_zis_id: String,
    pub jumlah_cents: i64,
    pub persen_amil_bp: i64,
    pub amil_cents: i64,
    pub bersih_cents: i64,
}

pub(crate) struct PreparedDistribusi {
    pub mustahiq_id: String,
    pub nama_mustahiq: String,
    pub tanggal: String,
    pub program_id: String,
    pub sub_program_id: String,
    pub asnaf_id: String,
    pub jumlah_cents: i64,
    pub keterangan: Option<String>,
}

/// Validates the draft against the catalog and the registry and resolves
/// everything to storable ids. Does not touch the ledger.
pub(crate) fn prepare_penerimaan(
    conn: &Connection,
    draft: &PenerimaanDraft,
) -> CoreResult<PreparedPenerimaan> {
    let tanggal = normalize_date_strict(&draft.tanggal)?;
    let via = catalog::resolve(conn, RefCategory::Via, draft.via.trim())?;
    let metode = catalog::resolve_child(
        conn,
        RefCategory::MetodeBayar,
        draft.metode_bayar.trim(),
        draft.via.trim(),
    )?;
    let jenis_zis = catalog::resolve_child(
        conn,
        RefCategory::JenisZis,
        draft.jenis_zis.trim(),
        draft.zis.trim(),
    )?;
    let rate_bp = parse_amil_rate_bp(&draft.persen_amil)?;
    let split = allocate(draft.jumlah_cents, rate_bp)?;

    let muzakki = load_party(conn, PartyKind::Muzakki, &draft.muzakki_id)?;

    Ok(PreparedPenerimaan {
        muzakki_id: muzakki.id,
        nama_muzakki: muzakki.nama,
        telepon_muzakki: muzakki.telepon,
        tanggal,
        via_id: via.id,
        metode_bayar_id: metode.id,
        jenis_zis_id: jenis_zis.id,
        jumlah_cents: draft.jumlah_cents,
        persen_amil_bp: rate_bp,
        amil_cents: split.amil_cents,
        bersih_cents: split.bersih_cents,
    })
}

pub(crate) fn prepare_distribusi(
    conn: &Connection,
    draft: &DistribusiDraft,
) -> CoreResult<PreparedDistribusi> {
    let tanggal = normalize_date_strict(&draft.tanggal)?;
    if draft.jumlah_cents <= 0 {
        return Err(CoreError::validation(format!(
            "jumlah harus lebih dari 0, diterima {}",
            draft.jumlah_cents
        )));
    }
    let program = catalog::resolve(conn, RefCategory::Program, draft.program.trim())?;
    let sub_program = catalog::resolve_child(
        conn,
        RefCategory::SubProgram,
        draft.sub_program.trim(),
        draft.program.trim(),
    )?;

    let mustahiq = load_party(conn, PartyKind::Mustahiq, &draft.mustahiq_id)?;
    if mustahiq.status == "blacklist" {
        return Err(CoreError::validation(format!(
            "mustahiq masuk daftar hitam: {}",
            mustahiq.no_registrasi
        )));
    }

    let asnaf_id = match draft.asnaf.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => catalog::resolve(conn, RefCategory::Asnaf, name)?.id,
        None => {
            let name = mustahiq
                .asnaf
                .as_deref()
                .ok_or_else(|| CoreError::validation("asnaf mustahiq tidak tersedia"))?;
            catalog::resolve(conn, RefCategory::Asnaf, name)?.id
        }
    };

    Ok(PreparedDistribusi {
        mustahiq_id: mustahiq.id,
        nama_mustahiq: mustahiq.nama,
        tanggal,
        program_id: program.id,
        sub_program_id: sub_program.id,
        asnaf_id,
        jumlah_cents: draft.jumlah_cents,
        keterangan: draft
            .keterangan
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

pub(crate) fn penerimaan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Penerimaan> {
    Ok(Penerimaan {
        id: row.get(0)?,
        muzakki_id: row.get(1)?,
        nama_muzakki: row.get(2)?,
        telepon_muzakki: row.get(3)?,
        tanggal: row.get(4)?,
        via: row.get(5)?,
        metode_bayar: row.get(6)?,
        jenis_zis: row.get(7)?,
        jumlah_cents: row.get(8)?,
        persen_amil_bp: row.get(9)?,
        amil_cents: row.get(10)?,
        bersih_cents: row.get(11)?,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub(crate) const PENERIMAAN_SELECT: &str = r#"
    SELECT p.id, p.muzakki_id, p.nama_muzakki, p.telepon_muzakki, p.tanggal,
           v.name, m.name, j.name,
           p.jumlah_cents, p.persen_amil_bp, p.amil_cents, p.bersih_cents,
           p.created_by, p.created_at, p.updated_at
    FROM penerimaan p
    JOIN reference_entries v ON v.id = p.via_id
    JOIN reference_entries m ON m.id = p.metode_bayar_id
    JOIN reference_entries j ON j.id = p.jenis_zis_id
"#;

pub(crate) fn distribusi_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Distribusi> {
    Ok(Distribusi {
        id: row.get(0)?,
        mustahiq_id: row.get(1)?,
        nama_mustahiq: row.get(2)?,
        tanggal: row.get(3)?,
        program: row.get(4)?,
        sub_program: row.get(5)?,
        asnaf: row.get(6)?,
        jumlah_cents: row.get(7)?,
        keterangan: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub(crate) const DISTRIBUSI_SELECT: &str = r#"
    SELECT d.id, d.mustahiq_id, d.nama_mustahiq, d.tanggal,
           pr.name, sp.name, a.name,
           d.jumlah_cents, d.keterangan, d.created_by, d.created_at, d.updated_at
    FROM distribusi d
    JOIN reference_entries pr ON pr.id = d.program_id
    JOIN reference_entries sp ON sp.id = d.sub_program_id
    JOIN reference_entries a ON a.id = d.asnaf_id
"#;

pub(crate) fn load_penerimaan(conn: &Connection, id: &str) -> CoreResult<Penerimaan> {
    let sql = format!("{PENERIMAAN_SELECT} WHERE p.id = ?1");
    conn.query_row(&sql, [id], penerimaan_from_row)
        .optional()?
        .ok_or_else(|| CoreError::validation(format!("penerimaan tidak ditemukan: {id}")))
}

pub(crate) fn penerimaan_exists(conn: &Connection, id: &str) -> CoreResult<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM penerimaan WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn load_distribusi(conn: &Connection, id: &str) -> CoreResult<Distribusi> {
    let sql = format!("{DISTRIBUSI_SELECT} WHERE d.id = ?1");
    conn.query_row(&sql, [id], distribusi_from_row)
        .optional()?
        .ok_or_else(|| CoreError::validation(format!("distribusi tidak ditemukan: {id}")))
}

pub(crate) fn distribusi_exists(conn: &Connection, id: &str) -> CoreResult<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM distribusi WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn snapshot_json<T: Serialize>(value: &T) -> CoreResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| CoreError::Storage(format!("gagal menserialisasi snapshot: {e}")))
}

/// Inserts an already-validated receipt, bumps the muzakki aggregates and
/// writes the audit record, all against the caller's transaction.
pub(crate) fn insert_penerimaan(
    conn: &Connection,
    id: &str,
    prepared: &PreparedPenerimaan,
    actor: &Actor,
) -> CoreResult<Penerimaan> {
    conn.execute(
        r#"
        INSERT INTO penerimaan(id, muzakki_id, nama_muzakki, telepon_muzakki, tanggal,
                               via_id, metode_bayar_id, jenis_zis_id,
                               jumlah_cents, persen_amil_bp, amil_cents, bersih_cents,
                               created_by)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            id,
            prepared.muzakki_id,
            prepared.nama_muzakki,
            prepared.telepon_muzakki,
            prepared.tanggal,
            prepared.via_id,
            prepared.metode_bayar_id,
            prepared.jenis_zis_id,
            prepared.jumlah_cents,
            prepared.persen_amil_bp,
            prepared.amil_cents,
            prepared.bersih_cents,
            actor.user_id,
        ],
    )?;
    apply_ledger_event(
        conn,
        PartyKind::Muzakki,
        &prepared.muzakki_id,
        prepared.jumlah_cents,
        &prepared.tanggal,
    )?;
    let row = load_penerimaan(conn, id)?;
    let after = snapshot_json(&row)?;
    record_audit(conn, "penerimaan", AuditAction::Insert, None, Some(&after), actor)?;
    Ok(row)
}

/// Re-points an existing receipt at new validated values. The old aggregate
/// contribution is reversed and the new one applied, so totals stay exact
/// even when the muzakki changes.
pub(crate) fn overwrite_penerimaan(
    conn: &Connection,
    id: &str,
    prepared: &PreparedPenerimaan,
    actor: &Actor,
) -> CoreResult<Penerimaan> {
    let before_row = load_penerimaan(conn, id)?;
    let old_muzakki_id = before_row.muzakki_id.clone();
    let old_jumlah = before_row.jumlah_cents;

    conn.execute(
        r#"
        UPDATE penerimaan
        SET muzakki_id = ?1, nama_muzakki = ?2, telepon_muzakki = ?3, tanggal = ?4,
            via_id = ?5, metode_bayar_id = ?6, jenis_zis_id = ?7,
            jumlah_cents = ?8, persen_amil_bp = ?9, amil_cents = ?10, bersih_cents = ?11,
            updated_at = datetime('now')
        WHERE id = ?12
        "#,
        params![
            prepared.muzakki_id,
            prepared.nama_muzakki,
            prepared.telepon_muzakki,
            prepared.tanggal,
            prepared.via_id,
            prepared.metode_bayar_id,
            prepared.jenis_zis_id,
            prepared.jumlah_cents,
            prepared.persen_amil_bp,
            prepared.amil_cents,
            prepared.bersih_cents,
            id,
        ],
    )?;
    // Reverse after the row moved so the last-date recompute sees the final
    // ledger state.
    reverse_ledger_event(conn, PartyKind::Muzakki, &old_muzakki_id, old_jumlah)?;
    apply_ledger_event(
        conn,
        PartyKind::Muzakki,
        &prepared.muzakki_id,
        prepared.jumlah_cents,
        &prepared.tanggal,
    )?;

    let row = load_penerimaan(conn, id)?;
    let before = snapshot_json(&before_row)?;
    let after = snapshot_json(&row)?;
    record_audit(
        conn,
        "penerimaan",
        AuditAction::Update,
        Some(&before),
        Some(&after),
        actor,
    )?;
    Ok(row)
}

pub fn record_penerimaan_at_db_path(
    db_path: &Path,
    draft: &PenerimaanDraft,
    actor: &Actor,
) -> CoreResult<Penerimaan> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let prepared = prepare_penerimaan(&tx, draft)?;
    let id = uuid::Uuid::new_v4().to_string();
    let row = insert_penerimaan(&tx, &id, &prepared, actor)?;
    tx.commit()?;
    Ok(row)
}

pub fn update_penerimaan_at_db_path(
    db_path: &Path,
    id: &str,
    draft: &PenerimaanDraft,
    actor: &Actor,
) -> CoreResult<Penerimaan> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let prepared = prepare_penerimaan(&tx, draft)?;
    let row = overwrite_penerimaan(&tx, id, &prepared, actor)?;
    tx.commit()?;
    Ok(row)
}

pub fn delete_penerimaan_at_db_path(
    db_path: &Path,
    id: &str,
    actor: &Actor,
) -> CoreResult<Penerimaan> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let row = load_penerimaan(&tx, id)?;
    tx.execute("DELETE FROM penerimaan WHERE id = ?1", [id])?;
    reverse_ledger_event(&tx, PartyKind::Muzakki, &row.muzakki_id, row.jumlah_cents)?;
    let before = snapshot_json(&row)?;
    record_audit(&tx, "penerimaan", AuditAction::Delete, Some(&before), None, actor)?;
    tx.commit()?;
    Ok(row)
}

pub(crate) fn insert_distribusi(
    conn: &Connection,
    id: &str,
    prepared: &PreparedDistribusi,
    actor: &Actor,
) -> CoreResult<Distribusi> {
    conn.execute(
        r#"
        INSERT INTO distribusi(id, mustahiq_id, nama_mustahiq, tanggal,
                               program_id, sub_program_id, asnaf_id,
                               jumlah_cents, keterangan, created_by)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            id,
            prepared.mustahiq_id,
            prepared.nama_mustahiq,
            prepared.tanggal,
            prepared.program_id,
            prepared.sub_program_id,
            prepared.asnaf_id,
            prepared.jumlah_cents,
            prepared.keterangan,
            actor.user_id,
        ],
    )?;
    apply_ledger_event(
        conn,
        PartyKind::Mustahiq,
        &prepared.mustahiq_id,
        prepared.jumlah_cents,
        &prepared.tanggal,
    )?;
    let row = load_distribusi(conn, id)?;
    let after = snapshot_json(&row)?;
    record_audit(conn, "distribusi", AuditAction::Insert, None, Some(&after), actor)?;
    Ok(row)
}

pub(crate) fn overwrite_distribusi(
    conn: &Connection,
    id: &str,
    prepared: &PreparedDistribusi,
    actor: &Actor,
) -> CoreResult<Distribusi> {
    let before_row = load_distribusi(conn, id)?;
    let old_mustahiq_id = before_row.mustahiq_id.clone();
    let old_jumlah = before_row.jumlah_cents;

    conn.execute(
        r#"
        UPDATE distribusi
        SET mustahiq_id = ?1, nama_mustahiq = ?2, tanggal = ?3,
            program_id = ?4, sub_program_id = ?5, asnaf_id = ?6,
            jumlah_cents = ?7, keterangan = ?8, updated_at = datetime('now')
        WHERE id = ?9
        "#,
        params![
            prepared.mustahiq_id,
            prepared.nama_mustahiq,
            prepared.tanggal,
            prepared.program_id,
            prepared.sub_program_id,
            prepared.asnaf_id,
            prepared.jumlah_cents,
            prepared.keterangan,
            id,
        ],
    )?;
    reverse_ledger_event(conn, PartyKind::Mustahiq, &old_mustahiq_id, old_jumlah)?;
    apply_ledger_event(
        conn,
        PartyKind::Mustahiq,
        &prepared.mustahiq_id,
        prepared.jumlah_cents,
        &prepared.tanggal,
    )?;

    let row = load_distribusi(conn, id)?;
    let before = snapshot_json(&before_row)?;
    let after = snapshot_json(&row)?;
    record_audit(
        conn,
        "distribusi",
        AuditAction::Update,
        Some(&before),
        Some(&after),
        actor,
    )?;
    Ok(row)
}

pub fn record_distribusi_at_db_path(
    db_path: &Path,
    draft: &DistribusiDraft,
    actor: &Actor,
) -> CoreResult<Distribusi> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let prepared = prepare_distribusi(&tx, draft)?;
    let id = uuid::Uuid::new_v4().to_string();
    let row = insert_distribusi(&tx, &id, &prepared, actor)?;
    tx.commit()?;
    Ok(row)
}

pub fn update_distribusi_at_db_path(
    db_path: &Path,
    id: &str,
    draft: &DistribusiDraft,
    actor: &Actor,
) -> CoreResult<Distribusi> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let prepared = prepare_distribusi(&tx, draft)?;
    let row = overwrite_distribusi(&tx, id, &prepared, actor)?;
    tx.commit()?;
    Ok(row)
}

pub fn delete_distribusi_at_db_path(
    db_path: &Path,
    id: &str,
    actor: &Actor,
) -> CoreResult<Distribusi> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;
    let row = load_distribusi(&tx, id)?;
    tx.execute("DELETE FROM distribusi WHERE id = ?1", [id])?;
    reverse_ledger_event(&tx, PartyKind::Mustahiq, &row.mustahiq_id, row.jumlah_cents)?;
    let before = snapshot_json(&row)?;
    record_audit(&tx, "distribusi", AuditAction::Delete, Some(&before), None, actor)?;
    tx.commit()?;
    Ok(row)
}
