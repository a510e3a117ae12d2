//! Interfaces to density-specific imputation models
//!
//! Models are keyed by CpG density, trained once from a density-homogeneous matrix set, persisted
//! to `<model_dir>/saved_model_<density>_cpgs<ext>`, and loaded read-only for imputation.
//!

use std::fmt;
use std::path::{Path, PathBuf};

use error_stack::{Context, Report};

use crate::matrix::{CleanMatrix, ImputedMatrix};

#[derive(Debug)]
pub struct ConfigurationError;

impl fmt::Display for ConfigurationError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Invalid configuration")
    }
}

impl Context for ConfigurationError {}

#[derive(Debug)]
pub struct ModelLoadError {
    pub cpg_density: usize,
}

impl fmt::Display for ModelLoadError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Failed to load imputation model for {} CpG bins",
            self.cpg_density
        )
    }
}

impl Context for ModelLoadError {}

#[derive(Debug)]
pub struct TrainingError {
    pub cpg_density: usize,
}

impl fmt::Display for TrainingError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Failed to train imputation model for {} CpG bins",
            self.cpg_density
        )
    }
}

impl Context for TrainingError {}

#[derive(Debug)]
pub struct InferenceError;

impl fmt::Display for InferenceError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Imputation model failed on input matrix")
    }
}

impl Context for InferenceError {}

/// Location of the persisted model for the given CpG density
///
pub fn get_model_path(model_dir: &Path, cpg_density: usize, extension: &str) -> PathBuf {
    model_dir.join(format!("saved_model_{cpg_density}_cpgs{extension}"))
}

/// A loaded model which fills in the missing calls of a matrix
///
pub trait ImputationModel {
    /// Return a matrix of the same shape as the input, where missing calls are replaced by the
    /// model's methylation probability and observed calls are unchanged
    ///
    fn impute(&mut self, matrix: &CleanMatrix) -> Result<ImputedMatrix, Report<InferenceError>>;
}

/// Loads a persisted model
///
pub trait ModelLoader {
    type Model: ImputationModel;

    /// File extension of the persisted model, including the leading '.'
    fn model_extension(&self) -> &str;

    fn load(
        &self,
        model_path: &Path,
        cpg_density: usize,
    ) -> Result<Self::Model, Report<ModelLoadError>>;
}

/// Trains and persists models
///
pub trait TrainingBackend {
    type Model;

    /// File extension of the persisted model, including the leading '.'
    fn model_extension(&self) -> &str;

    fn train(
        &self,
        cpg_density: usize,
        matrices: &[CleanMatrix],
    ) -> Result<Self::Model, Report<TrainingError>>;

    fn save(&self, model: &Self::Model, model_path: &Path) -> Result<(), Report<TrainingError>>;
}
