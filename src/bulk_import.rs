use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate};
use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::audit_log::Actor;
use crate::catalog::{self, RefCategory};
use crate::error::{CoreError, CoreResult};
use crate::ledger_db::open_connection;
use crate::ledger_mutations::{
    distribusi_exists, insert_distribusi, insert_penerimaan, overwrite_distribusi,
    overwrite_penerimaan, penerimaan_exists, prepare_distribusi, prepare_penerimaan,
    DistribusiDraft, PenerimaanDraft,
};
use crate::party_registry::{
    find_party_id_by_registration, register_party_tx, update_party_tx, PartyDraft, PartyKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Muzakki,
    Mustahiq,
    Penerimaan,
    Distribusi,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Muzakki => "muzakki",
            ImportKind::Mustahiq => "mustahiq",
            ImportKind::Penerimaan => "penerimaan",
            ImportKind::Distribusi => "distribusi",
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "muzakki" => Ok(ImportKind::Muzakki),
            "mustahiq" => Ok(ImportKind::Mustahiq),
            "penerimaan" => Ok(ImportKind::Penerimaan),
            "distribusi" => Ok(ImportKind::Distribusi),
            other => Err(CoreError::validation(format!(
                "jenis impor tidak dikenal: {other}"
            ))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RowError {
    pub row_index: usize,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ImportOutcome {
    pub log_id: String,
    pub kind: String,
    pub status: String,
    pub total_rows: usize,
    pub success_rows: usize,
    pub failed_rows: usize,
    pub errors: Vec<RowError>,
}

struct AliasSpec {
    canonical: &'static str,
    aliases: &'static [&'static str],
    required: bool,
}

const MUZAKKI_ALIASES: &[AliasSpec] = &[
    AliasSpec { canonical: "no_registrasi", aliases: &["no registrasi", "no. registrasi", "no_registrasi", "nomor registrasi"], required: true },
    AliasSpec { canonical: "nik", aliases: &["nik", "no ktp", "no. ktp"], required: false },
    AliasSpec { canonical: "nama", aliases: &["nama", "nama muzakki", "nama lengkap"], required: true },
    AliasSpec { canonical: "telepon", aliases: &["telepon", "no hp", "no. hp", "hp"], required: false },
    AliasSpec { canonical: "alamat", aliases: &["alamat"], required: false },
    AliasSpec { canonical: "kecamatan", aliases: &["kecamatan"], required: true },
    AliasSpec { canonical: "kelurahan", aliases: &["kelurahan", "desa/kelurahan"], required: true },
    AliasSpec { canonical: "jenis_upz", aliases: &["jenis upz", "jenis_upz", "upz"], required: false },
];

const MUSTAHIQ_ALIASES: &[AliasSpec] = &[
    AliasSpec { canonical: "no_registrasi", aliases: &["no registrasi", "no. registrasi", "no_registrasi", "nomor registrasi"], required: true },
    AliasSpec { canonical: "nik", aliases: &["nik", "no ktp", "no. ktp"], required: false },
    AliasSpec { canonical: "nama", aliases: &["nama", "nama mustahiq", "nama lengkap"], required: true },
    AliasSpec { canonical: "telepon", aliases: &["telepon", "no hp", "no. hp", "hp"], required: false },
    AliasSpec { canonical: "alamat", aliases: &["alamat"], required: false },
    AliasSpec { canonical: "kecamatan", aliases: &["kecamatan"], required: true },
    AliasSpec { canonical: "kelurahan", aliases: &["kelurahan", "desa/kelurahan"], required: true },
    AliasSpec { canonical: "asnaf", aliases: &["asnaf", "golongan asnaf"], required: true },
];

const PENERIMAAN_ALIASES: &[AliasSpec] = &[
    AliasSpec { canonical: "no_registrasi", aliases: &["no registrasi", "no. registrasi", "no_registrasi", "no registrasi muzakki"], required: true },
    AliasSpec { canonical: "tanggal", aliases: &["tanggal", "tgl", "tanggal setor"], required: true },
    AliasSpec { canonical: "via", aliases: &["via", "via setor"], required: true },
    AliasSpec { canonical: "metode_bayar", aliases: &["metode bayar", "metode_bayar", "metode pembayaran", "cara bayar"], required: true },
    AliasSpec { canonical: "zis", aliases: &["zis"], required: false },
    AliasSpec { canonical: "jenis_zis", aliases: &["jenis zis", "jenis_zis", "jenis"], required: true },
    AliasSpec { canonical: "jumlah", aliases: &["jumlah", "nominal", "jumlah setor"], required: true },
    AliasSpec { canonical: "persen_amil", aliases: &["persen amil", "persen_amil", "% amil", "hak amil"], required: false },
];

const DISTRIBUSI_ALIASES: &[AliasSpec] = &[
    AliasSpec { canonical: "no_registrasi", aliases: &["no registrasi", "no. registrasi", "no_registrasi", "no registrasi mustahiq"], required: true },
    AliasSpec { canonical: "tanggal", aliases: &["tanggal", "tgl", "tanggal salur"], required: true },
    AliasSpec { canonical: "program", aliases: &["program"], required: false },
    AliasSpec { canonical: "sub_program", aliases: &["sub program", "sub_program", "sub-program"], required: true },
    AliasSpec { canonical: "asnaf", aliases: &["asnaf", "golongan asnaf"], required: false },
    AliasSpec { canonical: "jumlah", aliases: &["jumlah", "nominal", "jumlah salur"], required: true },
    AliasSpec { canonical: "keterangan", aliases: &["keterangan", "catatan"], required: false },
];

fn aliases_for(kind: ImportKind) -> &'static [AliasSpec] {
    match kind {
        ImportKind::Muzakki => MUZAKKI_ALIASES,
        ImportKind::Mustahiq => MUSTAHIQ_ALIASES,
        ImportKind::Penerimaan => PENERIMAAN_ALIASES,
        ImportKind::Distribusi => DISTRIBUSI_ALIASES,
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn header_map(
    headers: &[String],
    specs: &'static [AliasSpec],
) -> CoreResult<HashMap<&'static str, usize>> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut map = HashMap::new();
    for spec in specs {
        let found = normalized
            .iter()
            .position(|h| spec.aliases.contains(&h.as_str()));
        match found {
            Some(idx) => {
                map.insert(spec.canonical, idx);
            }
            None if spec.required => {
                return Err(CoreError::validation(format!(
                    "kolom wajib tidak ditemukan: {}",
                    spec.canonical
                )))
            }
            None => {}
        }
    }
    Ok(map)
}

fn cell(map: &HashMap<&'static str, usize>, row: &[String], key: &str) -> Option<String> {
    map.get(key)
        .and_then(|&idx| row.get(idx))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn require_cell(
    map: &HashMap<&'static str, usize>,
    row: &[String],
    key: &'static str,
) -> CoreResult<String> {
    cell(map, row, key).ok_or_else(|| CoreError::validation(format!("kolom {key} kosong")))
}

fn trim_cell(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

pub fn read_csv_rows(path: &Path) -> CoreResult<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| CoreError::validation(format!("gagal membaca berkas csv: {e}")))?;

    let mut all_rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| CoreError::validation(format!("baris csv rusak: {e}")))?;
        all_rows.push(record.iter().map(trim_cell).collect());
    }
    if all_rows.is_empty() {
        return Err(CoreError::EmptySource);
    }
    let headers = all_rows.remove(0);
    Ok((headers, all_rows))
}

fn data_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => trim_cell(s),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        // Date cells surface as the raw serial; date parsing converts it.
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            if serial.fract() == 0.0 {
                format!("{}", serial as i64)
            } else {
                serial.to_string()
            }
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => trim_cell(s),
        Data::Error(e) => format!("#ERR:{e:?}"),
    }
}

pub fn read_xlsx_rows(path: &Path) -> CoreResult<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| CoreError::validation(format!("gagal membuka berkas excel: {e}")))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(CoreError::EmptySource)?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| CoreError::validation(format!("gagal membaca lembar '{sheet_name}': {e}")))?;

    let mut all_rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(data_to_string).collect())
        .collect();
    while matches!(all_rows.last(), Some(row) if row.iter().all(|c| c.is_empty())) {
        all_rows.pop();
    }
    if all_rows.is_empty() {
        return Err(CoreError::EmptySource);
    }
    let headers = all_rows.remove(0);
    Ok((headers, all_rows))
}

/// Parses a rupiah amount into cents. Accepts `Rp 1.234.567`, `1.234.567,89`,
/// `1234567.89` and bare digits; at most two decimal places.
pub fn parse_amount_to_cents(raw: &str) -> CoreResult<i64> {
    let mut text = raw.trim().to_string();
    for prefix in ["Rp.", "Rp", "rp.", "rp", "RP.", "RP"] {
        if let Some(stripped) = text.strip_prefix(prefix) {
            text = stripped.to_string();
            break;
        }
    }
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if text.is_empty() {
        return Err(CoreError::validation("jumlah kosong"));
    }
    if text.starts_with('-') {
        return Err(CoreError::validation(format!(
            "jumlah tidak boleh negatif: {raw}"
        )));
    }

    let has_dot = text.contains('.');
    let has_comma = text.contains(',');
    let (int_part, frac_part) = if has_dot && has_comma {
        // The later separator is the decimal point, the other marks thousands.
        let dec = if text.rfind('.') > text.rfind(',') { '.' } else { ',' };
        let thous = if dec == '.' { ',' } else { '.' };
        let cleaned = text.replace(thous, "");
        match cleaned.split_once(dec) {
            Some((i, f)) => (i.to_string(), f.to_string()),
            None => (cleaned, String::new()),
        }
    } else if has_dot || has_comma {
        let sep = if has_dot { '.' } else { ',' };
        let parts: Vec<&str> = text.split(sep).collect();
        let tail = parts[parts.len() - 1];
        if parts.len() == 2 && tail.len() <= 2 {
            (parts[0].to_string(), tail.to_string())
        } else if parts[1..].iter().all(|p| p.len() == 3) {
            // 1.234.567 style grouping.
            (parts.join(""), String::new())
        } else {
            return Err(CoreError::validation(format!(
                "format jumlah tidak dikenal: {raw}"
            )));
        }
    } else {
        (text, String::new())
    };

    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::validation(format!(
            "format jumlah tidak dikenal: {raw}"
        )));
    }
    if frac_part.len() > 2 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::validation(format!(
            "format jumlah tidak dikenal: {raw}"
        )));
    }

    let whole: i64 = int_part
        .parse()
        .map_err(|_| CoreError::validation(format!("jumlah melewati batas: {raw}")))?;
    let mut cents = whole
        .checked_mul(100)
        .ok_or_else(|| CoreError::validation(format!("jumlah melewati batas: {raw}")))?;
    if !frac_part.is_empty() {
        let mut frac: i64 = frac_part.parse().unwrap_or(0);
        if frac_part.len() == 1 {
            frac *= 10;
        }
        cents += frac;
    }
    Ok(cents)
}

/// Excel stores dates as day counts from 1899-12-30.
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Accepts the interactive date forms plus dotted dates, `YYYY/MM/DD` and
/// Excel serial numbers. Returns the ISO form; range checking happens in the
/// mutation path.
pub fn normalize_date_flexible(raw: &str) -> CoreResult<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(CoreError::validation("tanggal kosong"));
    }

    for format in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Ok(date.format("%Y-%m-%d").to_string());
        }
    }

    // Excel serial, possibly with a time fraction.
    if let Ok(serial) = text.parse::<f64>() {
        let days = serial.trunc() as i64;
        if (1..=200_000).contains(&days) {
            let (ey, em, ed) = EXCEL_EPOCH;
            let epoch = NaiveDate::from_ymd_opt(ey, em, ed).expect("valid epoch");
            let date = epoch + Duration::days(days);
            return Ok(date.format("%Y-%m-%d").to_string());
        }
    }

    Err(CoreError::validation(format!(
        "format tanggal tidak dikenal: {text}"
    )))
}

fn party_draft_from_row(
    kind: PartyKind,
    map: &HashMap<&'static str, usize>,
    row: &[String],
) -> CoreResult<PartyDraft> {
    Ok(PartyDraft {
        no_registrasi: require_cell(map, row, "no_registrasi")?,
        nik: cell(map, row, "nik"),
        nama: require_cell(map, row, "nama")?,
        telepon: cell(map, row, "telepon"),
        alamat: cell(map, row, "alamat"),
        kecamatan: require_cell(map, row, "kecamatan")?,
        kelurahan: require_cell(map, row, "kelurahan")?,
        jenis_upz: match kind {
            PartyKind::Muzakki => cell(map, row, "jenis_upz"),
            PartyKind::Mustahiq => None,
        },
        asnaf: match kind {
            PartyKind::Muzakki => None,
            PartyKind::Mustahiq => Some(require_cell(map, row, "asnaf")?),
        },
    })
}

fn natural_ledger_id(kind: ImportKind, parts: &[&str]) -> String {
    let seed = format!("simzis:{}:{}", kind.as_str(), parts.join(":"));
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

fn import_party_row(
    conn: &rusqlite::Connection,
    kind: PartyKind,
    map: &HashMap<&'static str, usize>,
    row: &[String],
    actor: &Actor,
) -> CoreResult<()> {
    let draft = party_draft_from_row(kind, map, row)?;
    match find_party_id_by_registration(conn, kind, &draft.no_registrasi)? {
        Some(id) => {
            update_party_tx(conn, kind, &id, &draft, actor)?;
        }
        None => {
            register_party_tx(conn, kind, &draft, actor)?;
        }
    }
    Ok(())
}

fn import_penerimaan_row(
    conn: &rusqlite::Connection,
    map: &HashMap<&'static str, usize>,
    row: &[String],
    actor: &Actor,
) -> CoreResult<()> {
    let no_registrasi = require_cell(map, row, "no_registrasi")?;
    let muzakki_id = find_party_id_by_registration(conn, PartyKind::Muzakki, &no_registrasi)?
        .ok_or_else(|| CoreError::unresolved("muzakki", &no_registrasi))?;

    let tanggal = normalize_date_flexible(&require_cell(map, row, "tanggal")?)?;
    let jenis_zis = require_cell(map, row, "jenis_zis")?;
    let zis = match cell(map, row, "zis") {
        Some(zis) => zis,
        None => catalog::parent_name(conn, RefCategory::JenisZis, &jenis_zis)?,
    };
    let jumlah_cents = parse_amount_to_cents(&require_cell(map, row, "jumlah")?)?;
    let persen_amil = cell(map, row, "persen_amil").unwrap_or_else(|| "12.5".to_string());

    let draft = PenerimaanDraft {
        muzakki_id,
        tanggal: tanggal.clone(),
        via: require_cell(map, row, "via")?,
        metode_bayar: require_cell(map, row, "metode_bayar")?,
        zis,
        jenis_zis: jenis_zis.clone(),
        jumlah_cents,
        persen_amil,
    };
    let prepared = prepare_penerimaan(conn, &draft)?;

    let id = natural_ledger_id(
        ImportKind::Penerimaan,
        &[&no_registrasi, &tanggal, &jenis_zis, &jumlah_cents.to_string()],
    );
    if penerimaan_exists(conn, &id)? {
        overwrite_penerimaan(conn, &id, &prepared, actor)?;
    } else {
        insert_penerimaan(conn, &id, &prepared, actor)?;
    }
    Ok(())
}

fn import_distribusi_row(
    conn: &rusqlite::Connection,
    map: &HashMap<&'static str, usize>,
    row: &[String],
    actor: &Actor,
) -> CoreResult<()> {
    let no_registrasi = require_cell(map, row, "no_registrasi")?;
    let mustahiq_id = find_party_id_by_registration(conn, PartyKind::Mustahiq, &no_registrasi)?
        .ok_or_else(|| CoreError::unresolved("mustahiq", &no_registrasi))?;

    let tanggal = normalize_date_flexible(&require_cell(map, row, "tanggal")?)?;
    let sub_program = require_cell(map, row, "sub_program")?;
    let program = match cell(map, row, "program") {
        Some(program) => program,
        None => catalog::parent_name(conn, RefCategory::SubProgram, &sub_program)?,
    };
    let jumlah_cents = parse_amount_to_cents(&require_cell(map, row, "jumlah")?)?;

    let draft = DistribusiDraft {
        mustahiq_id,
        tanggal: tanggal.clone(),
        program,
        sub_program: sub_program.clone(),
        asnaf: cell(map, row, "asnaf"),
        jumlah_cents,
        keterangan: cell(map, row, "keterangan"),
    };
    let prepared = prepare_distribusi(conn, &draft)?;

    let id = natural_ledger_id(
        ImportKind::Distribusi,
        &[&no_registrasi, &tanggal, &sub_program, &jumlah_cents.to_string()],
    );
    if distribusi_exists(conn, &id)? {
        overwrite_distribusi(conn, &id, &prepared, actor)?;
    } else {
        insert_distribusi(conn, &id, &prepared, actor)?;
    }
    Ok(())
}

fn write_migration_log(
    conn: &rusqlite::Connection,
    kind: ImportKind,
    source_file: &str,
    status: &str,
    total: usize,
    success: usize,
    failed: usize,
    errors: &[RowError],
    actor: &Actor,
) -> CoreResult<String> {
    // failed is passed separately: an empty run logs an EmptySource reason
    // row while its counters stay at zero.
    let log_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        r#"
        INSERT INTO migration_logs(id, kind, source_file, status,
                                   total_rows, success_rows, failed_rows, user_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            log_id,
            kind.as_str(),
            source_file,
            status,
            total as i64,
            success as i64,
            failed as i64,
            actor.user_id,
        ],
    )?;
    for error in errors {
        tx.execute(
            r#"
            INSERT INTO migration_log_errors(log_id, row_index, reason, message)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![log_id, error.row_index as i64, error.reason, error.message],
        )?;
    }
    tx.commit()?;
    Ok(log_id)
}

/// Row-at-a-time import. Each row runs in its own transaction; a failed row
/// is rolled back, recorded and skipped, never aborting the batch. Re-running
/// the same source is safe: parties key on no_registrasi, ledger rows on a
/// deterministic natural-key id.
pub fn start_import_at_db_path(
    db_path: &Path,
    kind: ImportKind,
    headers: &[String],
    rows: &[Vec<String>],
    source_file: &str,
    actor: &Actor,
    cancel: Option<&AtomicBool>,
) -> CoreResult<ImportOutcome> {
    let conn = open_connection(db_path)?;

    if rows.is_empty() {
        let reason = CoreError::EmptySource;
        let errors = vec![RowError {
            row_index: 0,
            reason: reason.kind().to_string(),
            message: reason.to_string(),
        }];
        let log_id = write_migration_log(
            &conn, kind, source_file, "aborted", 0, 0, 0, &errors, actor,
        )?;
        log::warn!("import {} dari '{source_file}' dibatalkan, tanpa baris data", kind.as_str());
        return Ok(ImportOutcome {
            log_id,
            kind: kind.as_str().to_string(),
            status: "aborted".to_string(),
            total_rows: 0,
            success_rows: 0,
            failed_rows: 0,
            errors,
        });
    }

    let map = header_map(headers, aliases_for(kind))?;

    let mut visited = 0usize;
    let mut success = 0usize;
    let mut errors: Vec<RowError> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                log::warn!(
                    "import {} dihentikan pada baris {} dari {}",
                    kind.as_str(),
                    visited,
                    rows.len()
                );
                break;
            }
        }
        visited += 1;
        // 1-based data row ordinal, the header row not counted.
        let row_index = i + 1;

        let res: CoreResult<()> = (|| {
            let tx = conn.unchecked_transaction()?;
            match kind {
                ImportKind::Muzakki => import_party_row(&tx, PartyKind::Muzakki, &map, row, actor)?,
                ImportKind::Mustahiq => {
                    import_party_row(&tx, PartyKind::Mustahiq, &map, row, actor)?
                }
                ImportKind::Penerimaan => import_penerimaan_row(&tx, &map, row, actor)?,
                ImportKind::Distribusi => import_distribusi_row(&tx, &map, row, actor)?,
            }
            tx.commit()?;
            Ok(())
        })();

        match res {
            Ok(()) => success += 1,
            Err(err) => {
                log::warn!(
                    "import {} baris {row_index} gagal: {err}",
                    kind.as_str()
                );
                errors.push(RowError {
                    row_index,
                    reason: err.kind().to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    // aborted is reserved for runs where no data row was processed; a run
    // whose every row failed still completed its pass over the source.
    let status = if visited == 0 {
        "aborted"
    } else if errors.is_empty() {
        "completed"
    } else {
        "partially_completed"
    };
    let log_id = write_migration_log(
        &conn,
        kind,
        source_file,
        status,
        visited,
        success,
        errors.len(),
        &errors,
        actor,
    )?;
    log::info!(
        "import {} dari '{source_file}': {status}, {success}/{visited} baris berhasil",
        kind.as_str()
    );

    Ok(ImportOutcome {
        log_id,
        kind: kind.as_str().to_string(),
        status: status.to_string(),
        total_rows: visited,
        success_rows: success,
        failed_rows: errors.len(),
        errors,
    })
}

fn read_rows(file_path: &Path) -> CoreResult<(Vec<String>, Vec<Vec<String>>)> {
    let extension = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => read_csv_rows(file_path),
        "xlsx" | "xls" => read_xlsx_rows(file_path),
        other => Err(CoreError::validation(format!(
            "ekstensi berkas tidak didukung: {other}"
        ))),
    }
}

pub fn import_file_at_db_path(
    db_path: &Path,
    kind: ImportKind,
    file_path: &Path,
    actor: &Actor,
    cancel: Option<&AtomicBool>,
) -> CoreResult<ImportOutcome> {
    let (headers, rows) = read_rows(file_path)?;
    let source_file = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("(tanpa nama)")
        .to_string();
    start_import_at_db_path(db_path, kind, &headers, &rows, &source_file, actor, cancel)
}

/// First rows of a source file, for operator inspection before importing.
pub fn preview_file(file_path: &Path, limit: Option<usize>) -> CoreResult<Value> {
    let (headers, rows) = read_rows(file_path)?;
    let limit = limit.unwrap_or(10).clamp(1, 100);
    let sample: Vec<&Vec<String>> = rows.iter().take(limit).collect();
    Ok(json!({
        "headers": headers,
        "total_rows": rows.len(),
        "rows": sample,
    }))
}

pub fn query_migration_logs_at_db_path(
    db_path: &Path,
    kind: Option<ImportKind>,
    limit: Option<u32>,
) -> CoreResult<Value> {
    let conn = open_connection(db_path)?;
    let limit = limit.unwrap_or(50).clamp(1, 500);
    let kind_filter = kind.map(|k| k.as_str().to_string()).unwrap_or_default();
    let mut stmt = conn.prepare(
        r#"
        SELECT id, kind, source_file, status, total_rows, success_rows, failed_rows,
               user_id, created_at
        FROM migration_logs
        WHERE (?1 = '' OR kind = ?1)
        ORDER BY created_at DESC, id DESC
        LIMIT ?2
        "#,
    )?;
    let iter = stmt.query_map(params![kind_filter, limit as i64], |row| {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "kind": row.get::<_, String>(1)?,
            "source_file": row.get::<_, String>(2)?,
            "status": row.get::<_, String>(3)?,
            "total_rows": row.get::<_, i64>(4)?,
            "success_rows": row.get::<_, i64>(5)?,
            "failed_rows": row.get::<_, i64>(6)?,
            "user_id": row.get::<_, Option<String>>(7)?,
            "created_at": row.get::<_, String>(8)?,
        }))
    })?;
    let mut rows = Vec::new();
    for row in iter {
        rows.push(row?);
    }
    Ok(json!({ "rows": rows }))
}

pub fn migration_log_errors_at_db_path(db_path: &Path, log_id: &str) -> CoreResult<Value> {
    let conn = open_connection(db_path)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT row_index, reason, message
        FROM migration_log_errors
        WHERE log_id = ?1
        ORDER BY row_index ASC
        "#,
    )?;
    let iter = stmt.query_map([log_id], |row| {
        Ok(json!({
            "row_index": row.get::<_, i64>(0)?,
            "reason": row.get::<_, String>(1)?,
            "message": row.get::<_, String>(2)?,
        }))
    })?;
    let mut rows = Vec::new();
    for row in iter {
        rows.push(row?);
    }
    Ok(json!({ "log_id": log_id, "rows": rows }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_db::test_support;
    use crate::party_registry::test_fixtures::muzakki_draft;
    use crate::party_registry::{load_party, register_party_at_db_path};

    fn actor() -> Actor {
        Actor::new("petugas-import")
    }

    fn write_temp_csv(name: &str, content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "{name}_{}_{}.csv",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, content).expect("write csv");
        path
    }

    #[test]
    fn amount_parser_handles_rupiah_conventions() {
        assert_eq!(parse_amount_to_cents("Rp 1.234.567").unwrap(), 123_456_700);
        assert_eq!(parse_amount_to_cents("1.234.567,89").unwrap(), 123_456_789);
        assert_eq!(parse_amount_to_cents("1234567.89").unwrap(), 123_456_789);
        assert_eq!(parse_amount_to_cents("50000").unwrap(), 5_000_000);
        assert_eq!(parse_amount_to_cents("100,5").unwrap(), 10_050);
        assert!(parse_amount_to_cents("-500").is_err());
        assert!(parse_amount_to_cents("1.23.4").is_err());
        assert!(parse_amount_to_cents("abc").is_err());
        assert!(parse_amount_to_cents("").is_err());
    }

    #[test]
    fn flexible_dates_include_excel_serials() {
        assert_eq!(normalize_date_flexible("2024-01-01").unwrap(), "2024-01-01");
        assert_eq!(normalize_date_flexible("01/06/2024").unwrap(), "2024-06-01");
        assert_eq!(normalize_date_flexible("15.08.2023").unwrap(), "2023-08-15");
        // Serial 45292 is 2024-01-01.
        assert_eq!(normalize_date_flexible("45292").unwrap(), "2024-01-01");
        assert!(normalize_date_flexible("kemarin").is_err());
    }

    #[test]
    fn import_counts_successes_and_failures_per_row() {
        let db_path = test_support::migrated_temp_db("simzis_import_counting_test");
        register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.700", "Importir"),
            &actor(),
        )
        .expect("register");

        let csv_path = write_temp_csv(
            "simzis_import_counting",
            "No Registrasi,Tanggal,Via,Metode Bayar,Jenis ZIS,Jumlah,Persen Amil\n\
             MZ.700,2024-03-01,UPZ,Transfer,Zakat Maal,Rp 1.000.000,12.5\n\
             MZ.700,2024-03-02,Kurir Misterius,Transfer,Zakat Maal,500000,5\n\
             MZ.700,2024-03-03,UPZ,Tunai,Zakat Fitrah,250000,5\n",
        );
        let outcome = import_file_at_db_path(
            &db_path,
            ImportKind::Penerimaan,
            &csv_path,
            &actor(),
            None,
        )
        .expect("import");

        assert_eq!(outcome.total_rows, 3);
        assert_eq!(outcome.success_rows, 2);
        assert_eq!(outcome.failed_rows, 1);
        assert_eq!(outcome.status, "partially_completed");
        assert_eq!(outcome.errors[0].row_index, 2);
        assert_eq!(outcome.errors[0].reason, "UnresolvedReference");

        let errors =
            migration_log_errors_at_db_path(&db_path, &outcome.log_id).expect("errors");
        assert_eq!(errors["rows"].as_array().unwrap().len(), 1);

        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn run_with_only_failed_rows_is_partially_completed() {
        let db_path = test_support::migrated_temp_db("simzis_import_all_fail_test");

        // No party is registered, so every receipt row fails to resolve.
        let csv_path = write_temp_csv(
            "simzis_import_all_fail",
            "No Registrasi,Tanggal,Via,Metode Bayar,Jenis ZIS,Jumlah\n\
             MZ.999,2024-05-01,UPZ,Transfer,Zakat Maal,1.000.000\n\
             MZ.999,2024-05-02,UPZ,Tunai,Zakat Fitrah,50.000\n",
        );
        let outcome = import_file_at_db_path(
            &db_path,
            ImportKind::Penerimaan,
            &csv_path,
            &actor(),
            None,
        )
        .expect("import");

        assert_eq!(outcome.status, "partially_completed");
        assert_eq!(outcome.total_rows, 2);
        assert_eq!(outcome.success_rows, 0);
        assert_eq!(outcome.failed_rows, 2);

        let logs = query_migration_logs_at_db_path(&db_path, Some(ImportKind::Penerimaan), None)
            .expect("logs");
        let rows = logs["rows"].as_array().expect("rows");
        assert_eq!(rows[0]["status"], "partially_completed");
        assert_eq!(rows[0]["success_rows"], 0);
        assert_eq!(rows[0]["failed_rows"], 2);

        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn reimporting_the_same_file_does_not_double_count() {
        let db_path = test_support::migrated_temp_db("simzis_import_idempotent_test");
        let muzakki = register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.701", "Setia"),
            &actor(),
        )
        .expect("register");

        let csv_path = write_temp_csv(
            "simzis_import_idempotent",
            "No Registrasi,Tanggal,Via,Metode Bayar,Jenis ZIS,Jumlah\n\
             MZ.701,2024-04-01,UPZ,Transfer,Zakat Maal,1.000.000\n\
             MZ.701,2024-04-15,UPZ,Tunai,Zakat Fitrah,50.000\n",
        );
        let first = import_file_at_db_path(
            &db_path,
            ImportKind::Penerimaan,
            &csv_path,
            &actor(),
            None,
        )
        .expect("first import");
        assert_eq!(first.status, "completed");
        assert_eq!(first.success_rows, 2);

        let second = import_file_at_db_path(
            &db_path,
            ImportKind::Penerimaan,
            &csv_path,
            &actor(),
            None,
        )
        .expect("second import");
        assert_eq!(second.status, "completed");

        let conn = open_connection(&db_path).expect("open");
        let receipt_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM penerimaan", [], |r| r.get(0))
            .expect("count");
        assert_eq!(receipt_rows, 2);

        let party = load_party(&conn, PartyKind::Muzakki, &muzakki.id).expect("load");
        assert_eq!(party.jumlah_transaksi, 2);
        assert_eq!(party.total_cents, 105_000_000);
        assert_eq!(party.tanggal_terakhir.as_deref(), Some("2024-04-15"));

        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn party_import_registers_then_updates() {
        let db_path = test_support::migrated_temp_db("simzis_import_party_test");

        let first_csv = write_temp_csv(
            "simzis_import_party_a",
            "No Registrasi,Nama,Kecamatan,Kelurahan\n\
             MZ.702,Budi Santoso,Cempaka,Palam\n",
        );
        let outcome = import_file_at_db_path(
            &db_path,
            ImportKind::Muzakki,
            &first_csv,
            &actor(),
            None,
        )
        .expect("first import");
        assert_eq!(outcome.status, "completed");

        let second_csv = write_temp_csv(
            "simzis_import_party_b",
            "No Registrasi,Nama,Kecamatan,Kelurahan,Telepon\n\
             MZ.702,Budi Santoso Wijaya,Cempaka,Palam,08115551234\n",
        );
        import_file_at_db_path(&db_path, ImportKind::Muzakki, &second_csv, &actor(), None)
            .expect("second import");

        let conn = open_connection(&db_path).expect("open");
        let (count, nama, telepon): (i64, String, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(nama), MAX(telepon) FROM muzakki WHERE no_registrasi = 'MZ.702'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .expect("query");
        assert_eq!(count, 1);
        assert_eq!(nama, "Budi Santoso Wijaya");
        assert_eq!(telepon.as_deref(), Some("08115551234"));

        let _ = std::fs::remove_file(&first_csv);
        let _ = std::fs::remove_file(&second_csv);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn header_only_source_writes_aborted_log() {
        let db_path = test_support::migrated_temp_db("simzis_import_empty_test");
        let csv_path = write_temp_csv(
            "simzis_import_empty",
            "No Registrasi,Nama,Kecamatan,Kelurahan\n",
        );

        let outcome = import_file_at_db_path(
            &db_path,
            ImportKind::Muzakki,
            &csv_path,
            &actor(),
            None,
        )
        .expect("import");
        assert_eq!(outcome.status, "aborted");
        assert_eq!(outcome.total_rows, 0);

        let logs = query_migration_logs_at_db_path(&db_path, Some(ImportKind::Muzakki), None)
            .expect("logs");
        let rows = logs["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "aborted");
        assert_eq!(rows[0]["total_rows"], 0);
        assert_eq!(rows[0]["success_rows"], 0);
        assert_eq!(rows[0]["failed_rows"], 0);

        let reasons =
            migration_log_errors_at_db_path(&db_path, &outcome.log_id).expect("reasons");
        assert_eq!(reasons["rows"][0]["reason"], "EmptySource");

        let _ = std::fs::remove_file(&csv_path);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn cancellation_stops_after_the_current_row() {
        let db_path = test_support::migrated_temp_db("simzis_import_cancel_test");
        register_party_at_db_path(
            &db_path,
            PartyKind::Muzakki,
            &muzakki_draft("MZ.703", "Terhenti"),
            &actor(),
        )
        .expect("register");

        let headers: Vec<String> = ["No Registrasi", "Tanggal", "Via", "Metode Bayar", "Jenis ZIS", "Jumlah"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows: Vec<Vec<String>> = (1..=5)
            .map(|day| {
                vec![
                    "MZ.703".to_string(),
                    format!("2024-05-{day:02}"),
                    "UPZ".to_string(),
                    "Tunai".to_string(),
                    "Zakat Maal".to_string(),
                    "10.000".to_string(),
                ]
            })
            .collect();

        // Pre-set flag: the loop checks before every row, so nothing runs.
        let cancel = AtomicBool::new(true);
        let outcome = start_import_at_db_path(
            &db_path,
            ImportKind::Penerimaan,
            &headers,
            &rows,
            "manual.csv",
            &actor(),
            Some(&cancel),
        )
        .expect("import");
        assert_eq!(outcome.total_rows, 0);
        assert_eq!(outcome.status, "aborted");

        let _ = std::fs::remove_file(&db_path);
    }
}
