use thiserror::Error;

/// Fatal conditions raised while decoding an ELF object or its DWARF data.
///
/// Every decoder failure aborts the query that triggered it; no partial
/// results are handed back. Callers that want a fallback (for example a
/// symbol-table lookup when no DWARF covers an address) handle that above
/// this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported ELF object: {0}")]
    UnsupportedElf(String),

    #[error("unsupported DWARF: {0}")]
    UnsupportedDwarf(String),

    #[error("unrecognized DWARF form {0:#x}")]
    UnknownForm(u64),

    #[error("DWARF form {form:#x} cannot be read as {wanted}")]
    BadForm { form: u64, wanted: &'static str },

    #[error("attribute {0:#x} not present in DIE")]
    MissingAttribute(u64),

    #[error("DIE has no low PC")]
    NoLowPc,

    #[error("DIE has no high PC")]
    NoHighPc,

    #[error("unsupported line-number program: {0}")]
    UnsupportedLineProgram(String),

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("debug data ended early while reading {0}")]
    Truncated(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
