use std::path::Path;

use error_stack::{Report, ResultExt};
use log::info;

use crate::matrix::CleanMatrix;
use crate::model::{get_model_path, ConfigurationError, TrainingBackend, TrainingError};

fn validate_training_matrices(
    cpg_density: usize,
    matrices: &[CleanMatrix],
) -> Result<(), Report<ConfigurationError>> {
    if cpg_density == 0 {
        return Err(Report::new(ConfigurationError)
            .attach_printable("CpG density must be greater than 0"));
    }
    if matrices.is_empty() {
        return Err(Report::new(ConfigurationError).attach_printable("No training matrices"));
    }
    if let Some((index, matrix)) = matrices
        .iter()
        .enumerate()
        .find(|(_, x)| x.ncols() != cpg_density)
    {
        return Err(Report::new(ConfigurationError).attach_printable(format!(
            "Training matrix {} has {} CpG columns, expected {}",
            index,
            matrix.ncols(),
            cpg_density
        )));
    }
    Ok(())
}

/// Train a model for `cpg_density` from `matrices` and persist it to `output_dir`
///
/// The model is written as `saved_model_<cpg_density>_cpgs<ext>`. It is first written to a
/// temporary file in the same directory and renamed into place, so a failed save never leaves a
/// partial model under the final name.
///
pub fn train_model<B: TrainingBackend>(
    backend: &B,
    cpg_density: usize,
    output_dir: &Path,
    matrices: &[CleanMatrix],
) -> Result<B::Model, Report<TrainingError>> {
    validate_training_matrices(cpg_density, matrices)
        .change_context(TrainingError { cpg_density })?;

    info!(
        "Training imputation model for {} CpG bins from {} matrices",
        cpg_density,
        matrices.len()
    );
    let model = backend.train(cpg_density, matrices)?;

    std::fs::create_dir_all(output_dir)
        .change_context(TrainingError { cpg_density })
        .attach_printable_lazy(|| {
            format!("Can't create model directory '{}'", output_dir.display())
        })?;

    let extension = backend.model_extension();
    let model_path = get_model_path(output_dir, cpg_density, extension);
    let tmp_model_path = get_model_path(output_dir, cpg_density, &format!("{extension}.tmp"));

    if let Err(err) = backend.save(&model, &tmp_model_path) {
        let _ = std::fs::remove_file(&tmp_model_path);
        return Err(err);
    }

    std::fs::rename(&tmp_model_path, &model_path)
        .change_context(TrainingError { cpg_density })
        .attach_printable_lazy(|| format!("Can't move model into '{}'", model_path.display()))?;

    info!("Saved imputation model to '{}'", model_path.display());

    Ok(model)
}
