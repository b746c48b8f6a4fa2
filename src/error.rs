use thiserror::Error;

/// Failures while extracting kernel metadata from a code object.
///
/// These are the only recoverable errors in the library: a code object we
/// cannot parse simply contributes no kernel schemas. Everything else either
/// propagates the underlying runtime's status unchanged or aborts the process.
#[derive(Error, Debug)]
pub enum HsacoError {
    #[error("not a valid ELF code object: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("metadata note decode failed: {0}")]
    Metadata(#[from] rmp_serde::decode::Error),

    #[error("no vendor metadata note present")]
    MissingMetadata,
}

/// Report an unrecoverable condition and abort.
///
/// The library is a shared interposer and must never call `exit` (the host
/// application owns process exit); conditions it cannot recover from abort
/// instead.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort()
    }};
}

pub(crate) use fatal;
