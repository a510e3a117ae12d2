use ndarray::Array2;

use crate::matrix::ImputedMatrix;

/// Imputed values at or below this level are called unmethylated
pub const UNMETHYLATED_MAX_PROB: f32 = 0.2;

/// Imputed values at or above this level are called methylated
pub const METHYLATED_MIN_PROB: f32 = 0.8;

/// Final methylation call for one read at one CpG site
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiteCall {
    Unmethylated,
    Methylated,
    /// The imputation model was not confident enough to make a call
    Undetermined,
}

impl SiteCall {
    /// Numeric value of the call, with `None` for an undetermined site
    pub fn value(self) -> Option<f32> {
        match self {
            SiteCall::Unmethylated => Some(0.0),
            SiteCall::Methylated => Some(1.0),
            SiteCall::Undetermined => None,
        }
    }
}

pub type CalledMatrix = Array2<SiteCall>;

/// Convert a single imputed methylation value into a site call
///
/// Observed calls (exactly 0 or 1) pass through unchanged. Anything outside of [0,1], including the
/// missing call sentinel and NaN, is undetermined.
///
pub fn threshold(value: f32) -> SiteCall {
    if value == 0.0 {
        SiteCall::Unmethylated
    } else if value == 1.0 {
        SiteCall::Methylated
    } else if value > 0.0 && value <= UNMETHYLATED_MAX_PROB {
        SiteCall::Unmethylated
    } else if (METHYLATED_MIN_PROB..1.0).contains(&value) {
        SiteCall::Methylated
    } else {
        SiteCall::Undetermined
    }
}

/// Convert an imputed matrix into a called matrix of the same shape
///
pub fn threshold_matrix(matrix: &ImputedMatrix) -> CalledMatrix {
    matrix.mapv(threshold)
}
