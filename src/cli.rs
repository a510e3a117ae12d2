use std::path::Path;

use clap::{Args, Parser, Subcommand};
use log::error;
use simple_error::{bail, SimpleResult};

use crate::globals::{DEFAULT_BIN_SIZE, DEFAULT_MIN_MAPQ, PROGRAM_VERSION};

#[derive(Parser)]
#[command(
    author,
    version = PROGRAM_VERSION,
    about,
    help_template = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}"
)]
#[clap(rename_all = "kebab_case")]
pub struct Settings {
    #[command(subcommand)]
    pub command: Command,

    /// Prefix used for all file output. If the prefix includes a directory, the directory must
    /// already exist.
    #[arg(long, global = true, value_name = "PREFIX", default_value = env!("CARGO_PKG_NAME"))]
    pub output_prefix: String,

    /// Number of threads to use. Defaults to all logical cpus detected.
    #[arg(long = "threads", global = true, value_name = "THREAD_COUNT")]
    thread_count_option: Option<usize>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Extract read-by-CpG methylation matrices for all bins of one CpG density
    Extract(ExtractSettings),

    /// Train the imputation model for one CpG density from extracted matrices
    Train(TrainSettings),

    /// Impute missing methylation calls in extracted matrices
    Impute(ImputeSettings),
}

#[derive(Args)]
#[clap(rename_all = "kebab_case")]
pub struct ExtractSettings {
    /// Alignment file for input sample in BAM or CRAM format. Alignment file must be mapped and
    /// indexed, with MM/ML tags specifying 5mC methylation. If a CRAM file is provided, then
    /// `--ref` must also be specified.
    #[arg(long = "bam", value_name = "FILE")]
    pub bam_filename: String,

    /// Genome reference in FASTA format, required for CRAM input
    #[arg(long = "ref", value_name = "FILE")]
    pub ref_filename: Option<String>,

    /// Bin coverage table with a header including `bin` and `cpgs` columns. The table is read as
    /// tab-delimited for a '.tsv' or '.txt' extension, and comma-delimited otherwise.
    #[arg(long = "coverage", value_name = "FILE")]
    pub coverage_filename: String,

    /// Number of CpG sites per bin. Only bins with this CpG count are extracted.
    #[arg(long, value_name = "COUNT")]
    pub cpg_density: usize,

    /// Width of each bin in bases
    #[arg(long, default_value_t = DEFAULT_BIN_SIZE)]
    pub bin_size: i64,

    /// Minimum read mapping quality
    #[arg(long, default_value_t = DEFAULT_MIN_MAPQ)]
    pub min_mapq: u8,

    /// Ignore methylation calls within this many bases of the 5' end of read 1 or unpaired reads
    #[arg(long = "mbias-read1-5", value_name = "BASES", default_value_t = 0)]
    pub mbias_read1_5: usize,

    /// Ignore methylation calls within this many bases of the 3' end of read 1 or unpaired reads
    #[arg(long = "mbias-read1-3", value_name = "BASES", default_value_t = 0)]
    pub mbias_read1_3: usize,

    /// Ignore methylation calls within this many bases of the 5' end of read 2
    #[arg(long = "mbias-read2-5", value_name = "BASES", default_value_t = 0)]
    pub mbias_read2_5: usize,

    /// Ignore methylation calls within this many bases of the 3' end of read 2
    #[arg(long = "mbias-read2-3", value_name = "BASES", default_value_t = 0)]
    pub mbias_read2_3: usize,

    /// Label each output matrix with its bin id
    #[arg(long)]
    pub emit_bins: bool,
}

#[derive(Args)]
#[clap(rename_all = "kebab_case")]
pub struct TrainSettings {
    /// Matrix file from the extract step
    #[arg(long = "matrices", value_name = "FILE")]
    pub matrix_filename: String,

    /// Number of CpG sites per bin. All training matrices must have this many CpG columns.
    #[arg(long, value_name = "COUNT")]
    pub cpg_density: usize,

    /// Directory where the trained model is written. The directory is created if needed.
    #[arg(long, value_name = "DIR")]
    pub model_dir: String,
}

#[derive(Args)]
#[clap(rename_all = "kebab_case")]
pub struct ImputeSettings {
    /// Matrix file from the extract step
    #[arg(long = "matrices", value_name = "FILE")]
    pub matrix_filename: String,

    /// Number of CpG sites per bin, used to select the imputation model
    #[arg(long, value_name = "COUNT")]
    pub cpg_density: usize,

    /// Directory containing trained models
    #[arg(long, value_name = "DIR")]
    pub model_dir: String,

    /// Write continuous imputed values instead of thresholded methylation calls
    #[arg(long)]
    pub no_postprocess: bool,
}

/// Values immediately computed from the user settings, but not part of direct user inputs
///
pub struct DerivedSettings {
    /// Global thread count
    pub thread_count: usize,
}

fn check_required_filename(filename: &str, label: &str) -> SimpleResult<()> {
    if filename.is_empty() {
        bail!("Must specify {label} file");
    }
    if !Path::new(&filename).exists() {
        bail!("Can't find specified {label} file: '{filename}'");
    }
    Ok(())
}

fn check_optional_filename(filename_opt: &Option<String>, label: &str) -> SimpleResult<()> {
    if let Some(filename) = filename_opt {
        if !Path::new(&filename).exists() {
            bail!("Can't find specified {label} file: '{filename}'");
        }
    }
    Ok(())
}

fn check_cpg_density(cpg_density: usize) -> SimpleResult<()> {
    if cpg_density == 0 {
        bail!("--cpg-density argument must be greater than 0");
    }
    Ok(())
}

fn validate_extract_settings(settings: &ExtractSettings) -> SimpleResult<()> {
    use rust_htslib::bam;
    use std::ffi::OsStr;

    check_required_filename(&settings.bam_filename, "alignment")?;
    check_optional_filename(&settings.ref_filename, "reference")?;
    check_required_filename(&settings.coverage_filename, "bin coverage")?;
    check_cpg_density(settings.cpg_density)?;

    if settings.bin_size <= 0 {
        bail!("--bin-size argument must be greater than 0");
    }

    // Check if alignment file is cram
    let alignment_file_ext = Path::new(&settings.bam_filename)
        .extension()
        .and_then(OsStr::to_str);
    if alignment_file_ext == Some("cram") && settings.ref_filename.is_none() {
        bail!("The `--ref` option must be provided when input alignment file is in CRAM format");
    }

    // Test that the alignment file has an index recognized by htslib, so that this fails once here
    // instead of in every extraction task
    if let Err(error) = bam::IndexedReader::from_path(&settings.bam_filename) {
        bail!(
            "Failed to open indexed alignment file '{}': {}",
            settings.bam_filename,
            error
        );
    }
    Ok(())
}

fn validate_train_settings(settings: &TrainSettings) -> SimpleResult<()> {
    check_required_filename(&settings.matrix_filename, "matrix")?;
    check_cpg_density(settings.cpg_density)?;
    if settings.model_dir.is_empty() {
        bail!("Must specify model directory");
    }
    Ok(())
}

fn validate_impute_settings(settings: &ImputeSettings) -> SimpleResult<()> {
    check_required_filename(&settings.matrix_filename, "matrix")?;
    check_cpg_density(settings.cpg_density)?;
    if !Path::new(&settings.model_dir).is_dir() {
        bail!(
            "Can't find specified model directory: '{}'",
            settings.model_dir
        );
    }
    Ok(())
}

/// Validate settings and use these to produce derived settings
///
fn validate_and_fix_settings_impl(settings: &Settings) -> SimpleResult<DerivedSettings> {
    match &settings.command {
        Command::Extract(x) => validate_extract_settings(x)?,
        Command::Train(x) => validate_train_settings(x)?,
        Command::Impute(x) => validate_impute_settings(x)?,
    }

    let thread_count = match settings.thread_count_option {
        Some(count) => {
            if count == 0 {
                bail!("--threads argument must be greater than 0");
            }
            count
        }
        None => num_cpus::get(),
    };

    Ok(DerivedSettings { thread_count })
}

pub fn validate_and_fix_settings(settings: &Settings) -> DerivedSettings {
    match validate_and_fix_settings_impl(settings) {
        Ok(x) => x,
        Err(msg) => {
            error!("Invalid command-line setting: {}", msg);
            std::process::exit(exitcode::USAGE);
        }
    }
}

pub fn parse_settings() -> Settings {
    Settings::parse()
}
