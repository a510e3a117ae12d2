/// Global program name
///
pub const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");

/// Global version number
///
/// All client code should refer directly to this copy instead of using various possibly conflicting
/// environment variables. Falls back to the package version when the build has no git metadata.
pub const PROGRAM_VERSION: &str = match option_env!("VERGEN_GIT_DESCRIBE") {
    Some(x) => x,
    None => env!("CARGO_PKG_VERSION"),
};

/// Default width of the genomic bins described in the coverage table
pub const DEFAULT_BIN_SIZE: i64 = 100;

/// Default minimum mapping quality of reads used to build bin matrices
pub const DEFAULT_MIN_MAPQ: u8 = 20;

/// Interval between periodic progress log updates, in seconds
pub const PROGRESS_REPORT_INTERVAL_SECS: u64 = 30;
