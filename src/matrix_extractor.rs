//! Parallel extraction of clean methylation matrices for a batch of bins
//!

use std::fmt;
use std::sync::mpsc::channel;
use std::time::Duration;

use error_stack::{Context, Report, ResultExt};
use log::{debug, info, warn};

use crate::coverage::BinId;
use crate::globals::PROGRESS_REPORT_INTERVAL_SECS;
use crate::matrix::CleanMatrix;
use crate::model::ConfigurationError;
use crate::progress_reporter::ProgressReporter;
use crate::read_source::{ReadSource, ReadSourceError};

#[derive(Debug)]
pub struct ExtractionError;

impl fmt::Display for ExtractionError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Failed to extract bin methylation matrix")
    }
}

impl Context for ExtractionError {}

#[derive(Clone, Debug)]
pub struct MatrixExtractorOptions {
    /// Only matrices with exactly this many CpG columns are kept
    pub cpg_density: usize,

    /// Width of each bin, the bin window is `[end - bin_size, end)`
    pub bin_size: i64,

    /// Worker thread count, 0 selects all logical cpus
    pub thread_count: usize,
}

/// A clean matrix paired with the bin it was extracted from
#[derive(Clone, Debug, PartialEq)]
pub struct BinMatrix {
    pub bin: BinId,
    pub matrix: CleanMatrix,
}

impl AsRef<CleanMatrix> for BinMatrix {
    fn as_ref(&self) -> &CleanMatrix {
        &self.matrix
    }
}

/// Extract and clean the methylation matrix for a single bin
///
/// Also returns the reference position of each matrix column.
///
pub fn extract_bin_matrix<R: ReadSource>(
    read_source: &mut R,
    bin: &BinId,
    bin_size: i64,
) -> Result<(CleanMatrix, Vec<i64>), Report<ReadSourceError>> {
    let (start, end) = bin.window(bin_size);
    let reads = read_source.parse_reads(&bin.chrom, start, end)?;
    let raw_matrix = read_source.create_matrix(&reads);
    Ok((CleanMatrix::from_raw(&raw_matrix), raw_matrix.positions))
}

/// Summary counts of a completed extraction batch
#[derive(Debug, Default, PartialEq)]
struct ExtractionSummary {
    failed: usize,
    discarded: usize,
    kept: usize,
}

/// Extract clean matrices for all bins in parallel, keeping the bin label with each matrix
///
/// Every bin is processed as an independent task which builds its own read source from
/// `read_source_factory`. A task that fails is logged and its bin is left out of the result, the
/// rest of the batch is unaffected. Matrices whose column count differs from the requested CpG
/// density are discarded.
///
/// Results are returned in the same order as the input bins.
///
pub fn extract_matrices_with_bins<F, R>(
    bins: &[BinId],
    options: &MatrixExtractorOptions,
    read_source_factory: F,
) -> Result<Vec<BinMatrix>, Report<ConfigurationError>>
where
    F: Fn() -> Result<R, Report<ReadSourceError>> + Sync,
    R: ReadSource,
{
    if options.cpg_density == 0 {
        return Err(Report::new(ConfigurationError)
            .attach_printable("CpG density must be greater than 0"));
    }
    if options.bin_size <= 0 {
        return Err(Report::new(ConfigurationError)
            .attach_printable(format!("Bin size must be positive, got {}", options.bin_size)));
    }

    let thread_count = match options.thread_count {
        0 => num_cpus::get(),
        x => x,
    };

    info!(
        "Extracting {} CpG matrices from {} bins on {} threads",
        options.cpg_density,
        bins.len(),
        thread_count
    );

    let worker_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(thread_count)
        .build()
        .change_context(ConfigurationError)
        .attach_printable("Failed to build extraction thread pool")?;

    let progress_reporter = ProgressReporter::new(
        bins.len() as u64,
        "Extracted",
        "bins",
        Duration::from_secs(PROGRESS_REPORT_INTERVAL_SECS),
        false,
    );

    let (tx, rx) = channel();

    let progress_reporter = &progress_reporter;
    let read_source_factory = &read_source_factory;
    worker_pool.scope(move |scope| {
        for (bin_index, bin) in bins.iter().enumerate() {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let result = read_source_factory()
                    .and_then(|mut read_source| {
                        extract_bin_matrix(&mut read_source, bin, options.bin_size)
                    })
                    .change_context(ExtractionError)
                    .attach_printable_lazy(|| format!("Bin: {bin}"));
                progress_reporter.inc(1);
                tx.send((bin_index, result))
                    .expect("Extraction result receiver closed");
            });
        }
    });

    let mut results = rx.into_iter().collect::<Vec<_>>();
    results.sort_by_key(|(bin_index, _)| *bin_index);

    let mut summary = ExtractionSummary::default();
    let mut bin_matrices = Vec::new();
    for (bin_index, result) in results {
        let bin = &bins[bin_index];
        match result {
            Ok((matrix, positions)) => {
                if matrix.ncols() == options.cpg_density {
                    summary.kept += 1;
                    bin_matrices.push(BinMatrix {
                        bin: bin.clone(),
                        matrix,
                    });
                } else {
                    debug!(
                        "Discarding matrix for bin {} with {} CpG columns at positions {:?}",
                        bin,
                        matrix.ncols(),
                        positions
                    );
                    summary.discarded += 1;
                }
            }
            Err(err) => {
                warn!("Skipping bin {bin}: {err:?}");
                summary.failed += 1;
            }
        }
    }

    progress_reporter.clear();

    info!(
        "Extracted {} matrices from {} bins ({} failed, {} discarded for CpG count mismatch)",
        summary.kept,
        bins.len(),
        summary.failed,
        summary.discarded
    );

    Ok(bin_matrices)
}

/// Extract clean matrices for all bins in parallel
///
/// This is [extract_matrices_with_bins] without the bin labels.
///
pub fn extract_matrices<F, R>(
    bins: &[BinId],
    options: &MatrixExtractorOptions,
    read_source_factory: F,
) -> Result<Vec<CleanMatrix>, Report<ConfigurationError>>
where
    F: Fn() -> Result<R, Report<ReadSourceError>> + Sync,
    R: ReadSource,
{
    Ok(
        extract_matrices_with_bins(bins, options, read_source_factory)?
            .into_iter()
            .map(|x| x.matrix)
            .collect(),
    )
}
