//! Read-by-CpG methylation matrices at each stage of the imputation pipeline
//!

use ndarray::{Array2, Axis};

/// Stored value of a missing methylation call in a [CleanMatrix]
///
/// This is the bit pattern of -1 cast to the fixed-width unsigned cell type, so that it can never
/// collide with the valid calls 0 and 1.
pub const MISSING_CALL: u16 = -1i16 as u16;

/// Value of a missing methylation call at the imputation model boundary
pub const MODEL_MISSING_VALUE: f32 = -1.0;

/// Methylation calls for each read in a bin, before any cleaning
///
/// Rows are reads and columns are CpG sites. Column `j` corresponds to the 0-indexed reference
/// position `positions[j]`, with positions sorted in increasing order.
///
#[derive(Clone, Debug, PartialEq)]
pub struct RawMatrix {
    pub positions: Vec<i64>,
    pub calls: Array2<Option<u8>>,
}

/// Methylation call matrix with all fully-missing reads removed and missing calls replaced by
/// [MISSING_CALL]
///
#[derive(Clone, Debug, PartialEq)]
pub struct CleanMatrix {
    data: Array2<u16>,
}

impl CleanMatrix {
    /// Drop all reads without any methylation call, then fill the remaining missing calls with the
    /// sentinel value
    ///
    pub fn from_raw(raw: &RawMatrix) -> Self {
        let called_rows = raw
            .calls
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|x| x.is_some()))
            .map(|(row_index, _)| row_index)
            .collect::<Vec<_>>();

        let data = raw
            .calls
            .select(Axis(0), &called_rows)
            .mapv(|x| x.map_or(MISSING_CALL, |call| call as u16));
        Self { data }
    }

    /// Wrap values which are already in the clean encoding
    ///
    pub fn from_array(data: Array2<u16>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Array2<u16> {
        &self.data
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    /// True if any cell holds the missing call sentinel
    pub fn has_missing(&self) -> bool {
        self.data.iter().any(|&x| x == MISSING_CALL)
    }

    /// Translate to the floating point encoding expected by imputation models, where missing calls
    /// are [MODEL_MISSING_VALUE]
    ///
    pub fn model_input(&self) -> Array2<f32> {
        self.data.mapv(|x| {
            if x == MISSING_CALL {
                MODEL_MISSING_VALUE
            } else {
                x as f32
            }
        })
    }
}

impl AsRef<CleanMatrix> for CleanMatrix {
    fn as_ref(&self) -> &CleanMatrix {
        self
    }
}

/// Matrix of methylation values after imputation, with the same shape as its source [CleanMatrix]
pub type ImputedMatrix = Array2<f32>;
