use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use error_stack::{Context, Report, ResultExt};
use log::info;
use serde_derive::{Deserialize, Serialize};

/// Identifies a fixed-width genomic bin by chromosome and bin end position
///
/// Text form is `<chrom>_<end>`. The final underscore separates the coordinate, so chromosome
/// names containing underscores are handled.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct BinId {
    pub chrom: String,
    pub end: i64,
}

impl BinId {
    pub fn new(chrom: &str, end: i64) -> Self {
        Self {
            chrom: chrom.to_string(),
            end,
        }
    }

    /// Zero-indexed half-closed reference window covered by this bin
    pub fn window(&self, bin_size: i64) -> (i64, i64) {
        (std::cmp::max(self.end - bin_size, 0), self.end)
    }
}

impl fmt::Display for BinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.chrom, self.end)
    }
}

#[derive(Debug)]
pub struct BinIdParseError;

impl fmt::Display for BinIdParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Invalid bin label, expected format is '<chrom>_<end>'")
    }
}

impl Context for BinIdParseError {}

impl FromStr for BinId {
    type Err = Report<BinIdParseError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chrom, end) = s
            .rsplit_once('_')
            .ok_or_else(|| Report::new(BinIdParseError))
            .attach_printable_lazy(|| format!("Bin label: '{s}'"))?;
        if chrom.is_empty() {
            return Err(Report::new(BinIdParseError)
                .attach_printable(format!("Bin label has no chromosome name: '{s}'")));
        }
        let end = end
            .parse::<i64>()
            .change_context(BinIdParseError)
            .attach_printable_lazy(|| format!("Bin label: '{s}'"))?;
        Ok(Self::new(chrom, end))
    }
}

impl TryFrom<String> for BinId {
    type Error = Report<BinIdParseError>;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BinId> for String {
    fn from(value: BinId) -> Self {
        value.to_string()
    }
}

/// One row of the bin coverage table
///
/// Only the bin label and CpG density columns are used, any other columns are ignored.
///
#[derive(Clone, Debug, Deserialize)]
pub struct CoverageRecord {
    pub bin: BinId,

    /// Number of CpG sites covered by reads in this bin
    pub cpgs: usize,
}

#[derive(Debug)]
pub struct CoverageFileError;

impl fmt::Display for CoverageFileError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Error reading bin coverage file")
    }
}

impl Context for CoverageFileError {}

/// Read the bin coverage table
///
/// The table must have a header including `bin` and `cpgs` columns. Files with a `.tsv` or `.txt`
/// extension are tab-delimited, everything else is read as comma-delimited.
///
pub fn read_coverage_file(
    coverage_filename: &str,
) -> Result<Vec<CoverageRecord>, Report<CoverageFileError>> {
    info!("Processing bin coverage file '{}'", coverage_filename);

    let delimiter = match Path::new(coverage_filename)
        .extension()
        .and_then(|x| x.to_str())
    {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .comment(Some(b'#'))
        .from_path(coverage_filename)
        .change_context(CoverageFileError)
        .attach_printable_lazy(|| format!("Can't open coverage file '{coverage_filename}'"))?;

    let mut records = Vec::new();
    for result in reader.deserialize() {
        let record: CoverageRecord = result
            .change_context(CoverageFileError)
            .attach_printable_lazy(|| {
                format!(
                    "Failed to parse record {} of coverage file '{coverage_filename}'",
                    records.len() + 1
                )
            })?;
        records.push(record);
    }
    Ok(records)
}

/// Find all distinct bins with the given CpG density
///
/// Bins are returned in the order they are first found in the coverage records.
///
pub fn select_bins(coverage_records: &[CoverageRecord], cpg_density: usize) -> Vec<BinId> {
    let mut observed = HashSet::new();
    coverage_records
        .iter()
        .filter(|x| x.cpgs == cpg_density)
        .filter(|x| observed.insert(&x.bin))
        .map(|x| x.bin.clone())
        .collect()
}
