/// Application name used for directory and environment naming.
pub const APP_NAME: &str = "cairn";

/// Number of hex characters kept from a sha256 digest for store addresses.
pub const ADDRESS_LEN: usize = 32;

/// Environment variable overriding the store root.
pub const STORE_ENV: &str = "CAIRN_STORE";

/// Environment variable controlling whether failed build dirs are kept.
pub const KEEP_FAILED_ENV: &str = "CAIRN_KEEP_FAILED";

/// Environment variable overriding build parallelism.
pub const PARALLELISM_ENV: &str = "BUILD_PARALLELISM";

/// Timestamp used for archive entries and build environments (1980-01-01).
pub const SOURCE_DATE_EPOCH: u64 = 315_532_800;

/// Version written into lock owner records and entry metadata.
pub const RECORD_VERSION: u32 = 1;
