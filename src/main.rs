mod basemod;
mod cli;
mod coverage;
mod globals;
mod imputation;
mod matrix;
mod matrix_extractor;
mod matrix_io;
mod model;
mod postprocess;
mod progress_reporter;
mod read_source;
mod site_frequency_model;
mod trainer;

use std::fmt;
use std::path::Path;
use std::process;

use error_stack::{Context, Report, ResultExt};
use hhmmss::Hhmmss;
use log::{error, info, warn};

use crate::coverage::{read_coverage_file, select_bins};
use crate::globals::{PROGRAM_NAME, PROGRAM_VERSION};
use crate::imputation::ImputationStream;
use crate::matrix_extractor::{extract_matrices, extract_matrices_with_bins, MatrixExtractorOptions};
use crate::matrix_io::{read_matrix_file, write_matrix_file, ImputedMatrixWriter};
use crate::read_source::{BamReadSource, BamReadSourceOptions, MbiasTrim};
use crate::site_frequency_model::SiteFrequencyBackend;
use crate::trainer::train_model;

fn setup_logger(output_prefix: &str) -> Result<(), fern::InitError> {
    let log_filename = output_prefix.to_owned() + ".log";
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                PROGRAM_NAME,
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .chain(fern::log_file(log_filename)?)
        .apply()?;
    Ok(())
}

#[derive(Debug)]
struct RunError;

impl fmt::Display for RunError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{PROGRAM_NAME} run failed")
    }
}

impl Context for RunError {}

fn get_matrix_filename(output_prefix: &str, cpg_density: usize) -> String {
    format!("{output_prefix}.{cpg_density}cpgs.matrices.jsonl")
}

fn get_imputed_matrix_filename(output_prefix: &str, cpg_density: usize) -> String {
    format!("{output_prefix}.{cpg_density}cpgs.imputed.jsonl")
}

fn run_extract(
    settings: &cli::ExtractSettings,
    output_prefix: &str,
    derived_settings: &cli::DerivedSettings,
) -> Result<(), Report<RunError>> {
    let coverage_records =
        read_coverage_file(&settings.coverage_filename).change_context(RunError)?;
    let bins = select_bins(&coverage_records, settings.cpg_density);

    let read_source_options = BamReadSourceOptions {
        min_mapq: settings.min_mapq,
        mbias_trim: MbiasTrim {
            read1_5: settings.mbias_read1_5,
            read1_3: settings.mbias_read1_3,
            read2_5: settings.mbias_read2_5,
            read2_3: settings.mbias_read2_3,
        },
    };
    let extractor_options = MatrixExtractorOptions {
        cpg_density: settings.cpg_density,
        bin_size: settings.bin_size,
        thread_count: derived_settings.thread_count,
    };
    let read_source_factory = || {
        BamReadSource::new(
            &settings.bam_filename,
            settings.ref_filename.as_deref(),
            &read_source_options,
        )
    };

    let matrix_filename = get_matrix_filename(output_prefix, settings.cpg_density);
    let matrix_count = if settings.emit_bins {
        let bin_matrices =
            extract_matrices_with_bins(&bins, &extractor_options, read_source_factory)
                .change_context(RunError)?;
        write_matrix_file(
            &matrix_filename,
            bin_matrices.iter().map(|x| (Some(&x.bin), &x.matrix)),
        )
    } else {
        let matrices = extract_matrices(&bins, &extractor_options, read_source_factory)
            .change_context(RunError)?;
        write_matrix_file(&matrix_filename, matrices.iter().map(|x| (None, x)))
    }
    .change_context(RunError)?;

    info!("Wrote {matrix_count} matrices to '{matrix_filename}'");
    Ok(())
}

fn run_train(settings: &cli::TrainSettings) -> Result<(), Report<RunError>> {
    let matrices = read_matrix_file(&settings.matrix_filename)
        .change_context(RunError)?
        .map(|x| x.map(|x| x.matrix))
        .collect::<Result<Vec<_>, _>>()
        .change_context(RunError)?;

    train_model(
        &SiteFrequencyBackend,
        settings.cpg_density,
        Path::new(&settings.model_dir),
        &matrices,
    )
    .change_context(RunError)?;
    Ok(())
}

fn run_impute(settings: &cli::ImputeSettings, output_prefix: &str) -> Result<(), Report<RunError>> {
    // The stream stops at the first unreadable record, which is reported after the stream is done
    let mut read_error = None;
    let matrices = read_matrix_file(&settings.matrix_filename)
        .change_context(RunError)?
        .map_while(|x| match x {
            Ok(x) => Some(x),
            Err(err) => {
                read_error = Some(err);
                None
            }
        });

    let stream = ImputationStream::new(
        &SiteFrequencyBackend,
        Path::new(&settings.model_dir),
        settings.cpg_density,
        matrices,
        !settings.no_postprocess,
    )
    .change_context(RunError)?;

    let imputed_matrix_filename = get_imputed_matrix_filename(output_prefix, settings.cpg_density);
    let mut writer = ImputedMatrixWriter::new(&imputed_matrix_filename).change_context(RunError)?;

    let mut inferred_count = 0;
    let mut failed_count = 0;
    for (index, item) in stream.enumerate() {
        match item {
            Ok(item) => {
                if item.inferred {
                    inferred_count += 1;
                }
                writer
                    .write_matrix(item.source.bin.as_ref(), &item.matrix, item.inferred)
                    .change_context(RunError)?;
            }
            Err(err) => {
                warn!("Skipping matrix {}: {err:?}", index + 1);
                failed_count += 1;
            }
        }
    }
    let matrix_count = writer.finish().change_context(RunError)?;

    if let Some(err) = read_error {
        return Err(err.change_context(RunError));
    }

    info!(
        "Wrote {} matrices to '{}' ({} required imputation, {} failed)",
        matrix_count, imputed_matrix_filename, inferred_count, failed_count
    );
    Ok(())
}

fn run(
    settings: &cli::Settings,
    derived_settings: &cli::DerivedSettings,
) -> Result<(), Report<RunError>> {
    info!("Starting {PROGRAM_NAME} {PROGRAM_VERSION}");
    info!(
        "cmdline: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    info!("Running on {} threads", derived_settings.thread_count);
    let start = std::time::Instant::now();

    match &settings.command {
        cli::Command::Extract(x) => run_extract(x, &settings.output_prefix, derived_settings)?,
        cli::Command::Train(x) => run_train(x)?,
        cli::Command::Impute(x) => run_impute(x, &settings.output_prefix)?,
    }

    info!(
        "{PROGRAM_NAME} completed. Total Runtime: {}",
        start.elapsed().hhmmssxxx()
    );
    Ok(())
}

fn main() {
    let settings = cli::parse_settings();
    if let Err(err) = setup_logger(&settings.output_prefix) {
        eprintln!("Failed to initialize logging: {err}");
        process::exit(exitcode::CANTCREAT);
    }
    let derived_settings = cli::validate_and_fix_settings(&settings);

    if let Err(err) = run(&settings, &derived_settings) {
        error!("{err:?}");
        process::exit(2);
    }
}
