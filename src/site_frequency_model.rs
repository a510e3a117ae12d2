//! Baseline imputation backend using per-site methylation frequencies
//!

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use error_stack::{Report, ResultExt};
use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::matrix::{CleanMatrix, ImputedMatrix, MISSING_CALL, MODEL_MISSING_VALUE};
use crate::model::{
    ImputationModel, InferenceError, ModelLoadError, ModelLoader, TrainingBackend, TrainingError,
};

/// Imputes each missing call with the smoothed methylated fraction observed at that CpG column
/// over all training reads
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SiteFrequencyModel {
    pub cpg_density: usize,
    pub site_meth_freqs: Vec<f32>,
}

impl ImputationModel for SiteFrequencyModel {
    fn impute(&mut self, matrix: &CleanMatrix) -> Result<ImputedMatrix, Report<InferenceError>> {
        if matrix.ncols() != self.site_meth_freqs.len() {
            return Err(Report::new(InferenceError).attach_printable(format!(
                "Matrix has {} CpG columns but the model was trained on {}",
                matrix.ncols(),
                self.site_meth_freqs.len()
            )));
        }

        let mut imputed = matrix.model_input();
        for ((_, col), val) in imputed.indexed_iter_mut() {
            if *val == MODEL_MISSING_VALUE {
                *val = self.site_meth_freqs[col];
            }
        }
        Ok(imputed)
    }
}

/// Trains, saves and loads [SiteFrequencyModel] as json
///
#[derive(Default)]
pub struct SiteFrequencyBackend;

impl TrainingBackend for SiteFrequencyBackend {
    type Model = SiteFrequencyModel;

    fn model_extension(&self) -> &str {
        ".json"
    }

    fn train(
        &self,
        cpg_density: usize,
        matrices: &[CleanMatrix],
    ) -> Result<Self::Model, Report<TrainingError>> {
        let mut meth_counts = vec![0u64; cpg_density];
        let mut call_counts = vec![0u64; cpg_density];
        for matrix in matrices {
            if matrix.ncols() != cpg_density {
                return Err(Report::new(TrainingError { cpg_density }).attach_printable(format!(
                    "Training matrix has {} CpG columns",
                    matrix.ncols()
                )));
            }
            for ((_, col), &val) in matrix.data().indexed_iter() {
                if val == MISSING_CALL {
                    continue;
                }
                call_counts[col] += 1;
                meth_counts[col] += val as u64;
            }
        }

        // Laplace smoothing keeps sites without any training calls at 0.5
        let site_meth_freqs = meth_counts
            .iter()
            .zip(call_counts.iter())
            .map(|(&meth, &total)| ((meth + 1) as f64 / (total + 2) as f64) as f32)
            .collect::<Vec<_>>();

        info!(
            "Trained site frequency model for {} CpG bins from {} matrices",
            cpg_density,
            matrices.len()
        );

        Ok(SiteFrequencyModel {
            cpg_density,
            site_meth_freqs,
        })
    }

    fn save(&self, model: &Self::Model, model_path: &Path) -> Result<(), Report<TrainingError>> {
        let cpg_density = model.cpg_density;
        let file = File::create(model_path)
            .change_context(TrainingError { cpg_density })
            .attach_printable_lazy(|| format!("Can't create model file '{}'", model_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, model)
            .change_context(TrainingError { cpg_density })
            .attach_printable_lazy(|| format!("Can't write model file '{}'", model_path.display()))?;
        writer
            .flush()
            .change_context(TrainingError { cpg_density })
            .attach_printable_lazy(|| format!("Can't write model file '{}'", model_path.display()))
    }
}

impl ModelLoader for SiteFrequencyBackend {
    type Model = SiteFrequencyModel;

    fn model_extension(&self) -> &str {
        ".json"
    }

    fn load(
        &self,
        model_path: &Path,
        cpg_density: usize,
    ) -> Result<Self::Model, Report<ModelLoadError>> {
        let file = File::open(model_path)
            .change_context(ModelLoadError { cpg_density })
            .attach_printable_lazy(|| format!("Can't open model file '{}'", model_path.display()))?;
        let model: SiteFrequencyModel = serde_json::from_reader(BufReader::new(file))
            .change_context(ModelLoadError { cpg_density })
            .attach_printable_lazy(|| format!("Can't parse model file '{}'", model_path.display()))?;

        if model.cpg_density != cpg_density || model.site_meth_freqs.len() != cpg_density {
            return Err(Report::new(ModelLoadError { cpg_density }).attach_printable(format!(
                "Model file '{}' was trained for {} CpG bins",
                model_path.display(),
                model.cpg_density
            )));
        }
        Ok(model)
    }
}
