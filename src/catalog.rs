use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Closed set of reference vocabularies. Hierarchical categories carry a
/// parent category; entries of those categories must link to an existing
/// parent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCategory {
    Kecamatan,
    Kelurahan,
    Via,
    MetodeBayar,
    Zis,
    JenisZis,
    Program,
    SubProgram,
    Asnaf,
    JenisUpz,
}

impl RefCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefCategory::Kecamatan => "kecamatan",
            RefCategory::Kelurahan => "kelurahan",
            RefCategory::Via => "via",
            RefCategory::MetodeBayar => "metode_bayar",
            RefCategory::Zis => "zis",
            RefCategory::JenisZis => "jenis_zis",
            RefCategory::Program => "program",
            RefCategory::SubProgram => "sub_program",
            RefCategory::Asnaf => "asnaf",
            RefCategory::JenisUpz => "jenis_upz",
        }
    }

    pub fn parent(&self) -> Option<RefCategory> {
        match self {
            RefCategory::Kelurahan => Some(RefCategory::Kecamatan),
            RefCategory::MetodeBayar => Some(RefCategory::Via),
            RefCategory::JenisZis => Some(RefCategory::Zis),
            RefCategory::SubProgram => Some(RefCategory::Program),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> CoreResult<RefCategory> {
        match raw.trim() {
            "kecamatan" => Ok(RefCategory::Kecamatan),
            "kelurahan" => Ok(RefCategory::Kelurahan),
            "via" => Ok(RefCategory::Via),
            "metode_bayar" => Ok(RefCategory::MetodeBayar),
            "zis" => Ok(RefCategory::Zis),
            "jenis_zis" => Ok(RefCategory::JenisZis),
            "program" => Ok(RefCategory::Program),
            "sub_program" => Ok(RefCategory::SubProgram),
            "asnaf" => Ok(RefCategory::Asnaf),
            "jenis_upz" => Ok(RefCategory::JenisUpz),
            other => Err(CoreError::validation(format!(
                "kategori referensi tidak dikenal: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceEntry {
    pub id: String,
    pub category: String,
    pub name: String,
    pub parent_id: Option<String>,
}

// Region hierarchy of the working area (kecamatan -> kelurahan).
const KECAMATAN_KELURAHAN: &[(&str, &[&str])] = &[
    (
        "Banjarbaru Utara",
        &["Loktabat Utara", "Mentaos", "Komet", "Sungai Ulin"],
    ),
    (
        "Banjarbaru Selatan",
        &["Loktabat Selatan", "Kemuning", "Guntung Paikat", "Sungai Besar"],
    ),
    ("Cempaka", &["Cempaka", "Sungai Tiung", "Bangkal", "Palam"]),
    (
        "Landasan Ulin",
        &[
            "Landasan Ulin Timur",
            "Guntung Payung",
            "Syamsudin Noor",
            "Guntung Manggis",
        ],
    ),
    (
        "Liang Anggang",
        &[
            "Landasan Ulin Barat",
            "Landasan Ulin Selatan",
            "Landasan Ulin Tengah",
            "Landasan Ulin Utara",
        ],
    ),
];

// Collection channel -> payment methods available through it.
const VIA_METODE_BAYAR: &[(&str, &[&str])] = &[
    ("Datang Langsung", &["Tunai"]),
    ("UPZ", &["Tunai", "Transfer"]),
    ("Transfer Bank", &["Transfer"]),
    ("Layanan Jemput", &["Tunai"]),
];

const ZIS_JENIS: &[(&str, &[&str])] = &[
    ("Zakat", &["Zakat Maal", "Zakat Fitrah", "Zakat Profesi"]),
    ("Infaq", &["Infaq Terikat", "Infaq Tidak Terikat"]),
];

const PROGRAM_SUB_PROGRAM: &[(&str, &[&str])] = &[
    ("Ekonomi", &["Bantuan Modal Usaha", "Pelatihan Keterampilan"]),
    ("Pendidikan", &["Beasiswa", "Bantuan Perlengkapan Sekolah"]),
    ("Kesehatan", &["Bantuan Pengobatan", "Khitanan Massal"]),
    ("Kemanusiaan", &["Bantuan Bencana", "Bedah Rumah"]),
    ("Dakwah dan Advokasi", &["Bantuan Dai", "Operasional Masjid"]),
];

// The eight canonical beneficiary classes.
const ASNAF: &[&str] = &[
    "Fakir",
    "Miskin",
    "Amil",
    "Muallaf",
    "Riqab",
    "Gharim",
    "Fisabilillah",
    "Ibnu Sabil",
];

const JENIS_UPZ: &[&str] = &[
    "UPZ Instansi",
    "UPZ Masjid",
    "UPZ Sekolah",
    "UPZ Kelurahan",
];

fn entry_id(category: RefCategory, name: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("simzis:ref:{}:{name}", category.as_str()).as_bytes(),
    )
    .to_string()
}

fn insert_entry(
    conn: &Connection,
    category: RefCategory,
    name: &str,
    parent_id: Option<&str>,
) -> CoreResult<usize> {
    let changed = conn.execute(
        r#"
        INSERT INTO reference_entries(id, category, name, parent_id)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(category, name) DO NOTHING
        "#,
        params![entry_id(category, name), category.as_str(), name, parent_id],
    )?;
    Ok(changed)
}

fn seed_hierarchy(
    conn: &Connection,
    parent_category: RefCategory,
    child_category: RefCategory,
    pairs: &[(&str, &[&str])],
) -> CoreResult<usize> {
    let mut inserted = 0;
    for (parent_name, children) in pairs {
        inserted += insert_entry(conn, parent_category, parent_name, None)?;
        let parent_id = entry_id(parent_category, parent_name);
        for child_name in *children {
            inserted += insert_entry(conn, child_category, child_name, Some(&parent_id))?;
        }
    }
    Ok(inserted)
}

/// Idempotent seed of every vocabulary. Returns the number of entries
/// actually inserted (zero on a re-run).
pub fn seed_reference_catalog(conn: &Connection) -> CoreResult<usize> {
    let mut inserted = 0;
    inserted += seed_hierarchy(
        conn,
        RefCategory::Kecamatan,
        RefCategory::Kelurahan,
        KECAMATAN_KELURAHAN,
    )?;
    inserted += seed_hierarchy(conn, RefCategory::Via, RefCategory::MetodeBayar, VIA_METODE_BAYAR)?;
    inserted += seed_hierarchy(conn, RefCategory::Zis, RefCategory::JenisZis, ZIS_JENIS)?;
    inserted += seed_hierarchy(
        conn,
        RefCategory::Program,
        RefCategory::SubProgram,
        PROGRAM_SUB_PROGRAM,
    )?;
    for name in ASNAF {
        inserted += insert_entry(conn, RefCategory::Asnaf, name, None)?;
    }
    for name in JENIS_UPZ {
        inserted += insert_entry(conn, RefCategory::JenisUpz, name, None)?;
    }
    Ok(inserted)
}

/// Case-sensitive exact match on the canonical name. Callers trim and
/// normalize before calling.
pub fn resolve(conn: &Connection, category: RefCategory, name: &str) -> CoreResult<ReferenceEntry> {
    let found = conn
        .query_row(
            "SELECT id, category, name, parent_id FROM reference_entries WHERE category = ?1 AND name = ?2",
            params![category.as_str(), name],
            |row| {
                Ok(ReferenceEntry {
                    id: row.get(0)?,
                    category: row.get(1)?,
                    name: row.get(2)?,
                    parent_id: row.get(3)?,
                })
            },
        )
        .optional()?;
    found.ok_or_else(|| CoreError::unresolved(category.as_str(), name))
}

/// Resolves an entry of a hierarchical category and verifies it belongs to
/// the named parent.
pub fn resolve_child(
    conn: &Connection,
    category: RefCategory,
    name: &str,
    parent_name: &str,
) -> CoreResult<ReferenceEntry> {
    let parent_category = category.parent().ok_or_else(|| {
        CoreError::validation(format!(
            "kategori {} tidak memiliki induk",
            category.as_str()
        ))
    })?;
    let parent = resolve(conn, parent_category, parent_name)?;
    let entry = resolve(conn, category, name)?;
    if entry.parent_id.as_deref() != Some(parent.id.as_str()) {
        return Err(CoreError::InvalidHierarchy(format!(
            "{} '{name}' bukan bagian dari {} '{parent_name}'",
            category.as_str(),
            parent_category.as_str()
        )));
    }
    Ok(entry)
}

/// Name of the parent entry of a hierarchical entry. Legacy import sheets
/// often carry only the child column.
pub(crate) fn parent_name(
    conn: &Connection,
    category: RefCategory,
    name: &str,
) -> CoreResult<String> {
    let entry = resolve(conn, category, name)?;
    let parent_id = entry.parent_id.ok_or_else(|| {
        CoreError::validation(format!(
            "kategori {} tidak memiliki induk",
            category.as_str()
        ))
    })?;
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM reference_entries WHERE id = ?1",
            [parent_id],
            |row| row.get(0),
        )
        .optional()?;
    found.ok_or_else(|| CoreError::Storage(format!("induk referensi hilang untuk '{name}'")))
}

pub fn children(
    conn: &Connection,
    category: RefCategory,
    parent_name: &str,
) -> CoreResult<Vec<ReferenceEntry>> {
    let parent_category = category.parent().ok_or_else(|| {
        CoreError::validation(format!(
            "kategori {} tidak memiliki induk",
            category.as_str()
        ))
    })?;
    let parent = resolve(conn, parent_category, parent_name)?;
    let mut stmt = conn.prepare(
        r#"
        SELECT id, category, name, parent_id
        FROM reference_entries
        WHERE category = ?1 AND parent_id = ?2
        ORDER BY name ASC
        "#,
    )?;
    let rows = stmt.query_map(params![category.as_str(), parent.id], |row| {
        Ok(ReferenceEntry {
            id: row.get(0)?,
            category: row.get(1)?,
            name: row.get(2)?,
            parent_id: row.get(3)?,
        })
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}
