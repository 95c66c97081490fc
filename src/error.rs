use thiserror::Error;

/// Error taxonomy shared by every core operation.
///
/// Bulk import records `kind()` tags per failed row; interactive operations
/// surface the error to the caller unchanged.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validasi gagal: {0}")]
    Validation(String),

    #[error("referensi tidak ditemukan: {category} '{name}'")]
    UnresolvedReference { category: String, name: String },

    #[error("hierarki referensi tidak cocok: {0}")]
    InvalidHierarchy(String),

    #[error("identitas duplikat: {0}")]
    DuplicateIdentity(String),

    #[error("input alokasi amil tidak valid: {0}")]
    InvalidAllocationInput(String),

    #[error("tidak dapat dihapus, masih direferensikan: {0}")]
    ReferentialRestrict(String),

    #[error("operasi penyimpanan melewati batas waktu: {0}")]
    StorageTimeout(String),

    #[error("berkas sumber kosong")]
    EmptySource,

    #[error("kesalahan penyimpanan: {0}")]
    Storage(String),
}

impl CoreError {
    /// Stable machine-readable tag, used for per-row import failure reasons
    /// and by the adapter error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "ValidationError",
            CoreError::UnresolvedReference { .. } => "UnresolvedReference",
            CoreError::InvalidHierarchy(_) => "InvalidHierarchy",
            CoreError::DuplicateIdentity(_) => "DuplicateIdentity",
            CoreError::InvalidAllocationInput(_) => "InvalidAllocationInput",
            CoreError::ReferentialRestrict(_) => "ReferentialRestrict",
            CoreError::StorageTimeout(_) => "StorageTimeout",
            CoreError::EmptySource => "EmptySource",
            CoreError::Storage(_) => "StorageError",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn unresolved(category: impl Into<String>, name: impl Into<String>) -> Self {
        CoreError::UnresolvedReference {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        if let rusqlite::Error::SqliteFailure(inner, message) = &err {
            match inner.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return CoreError::StorageTimeout(err.to_string());
                }
                // A uniqueness race on the identity columns that slipped past
                // the pre-insert check still surfaces as a duplicate, not as
                // an opaque storage failure.
                ErrorCode::ConstraintViolation => {
                    let detail = message.as_deref().unwrap_or_default();
                    if detail.contains("no_registrasi") || detail.contains(".nik") {
                        return CoreError::DuplicateIdentity(format!(
                            "identitas sudah terdaftar: {detail}"
                        ));
                    }
                }
                _ => {}
            }
        }
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
