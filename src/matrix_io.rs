//! JSON lines files of clean and imputed matrices
//!
//! Each line holds one matrix as `{"bin": "<chrom>_<end>", "rows": R, "cols": C, "values": [...]}`,
//! with values flattened in row-major order. The `bin` field is omitted for unlabeled matrices.
//! Clean matrices store missing calls as -1. Imputed matrices additionally record whether the
//! values are thresholded site calls and whether the model was run, and use `null` for undetermined
//! or non-finite values.
//!

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};

use error_stack::{Context, Report, ResultExt};
use log::info;
use ndarray::Array2;
use serde_derive::{Deserialize, Serialize};

use crate::coverage::BinId;
use crate::imputation::StreamMatrix;
use crate::matrix::{CleanMatrix, MISSING_CALL};

#[derive(Debug)]
pub struct MatrixIoError;

impl fmt::Display for MatrixIoError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("Matrix file error")
    }
}

impl Context for MatrixIoError {}

/// Missing call value used in matrix files
const FILE_MISSING_CALL: i32 = -1;

#[derive(Deserialize, Serialize)]
struct BinMatrixRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bin: Option<BinId>,
    rows: usize,
    cols: usize,
    values: Vec<i32>,
}

impl BinMatrixRecord {
    fn new(bin: Option<&BinId>, matrix: &CleanMatrix) -> Self {
        let values = matrix
            .data()
            .iter()
            .map(|&x| {
                if x == MISSING_CALL {
                    FILE_MISSING_CALL
                } else {
                    x as i32
                }
            })
            .collect();
        Self {
            bin: bin.cloned(),
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            values,
        }
    }

    fn into_stored_matrix(self) -> Result<StoredMatrix, Report<MatrixIoError>> {
        let values = self
            .values
            .iter()
            .map(|&x| match x {
                FILE_MISSING_CALL => Ok(MISSING_CALL),
                0 | 1 => Ok(x as u16),
                _ => Err(Report::new(MatrixIoError)
                    .attach_printable(format!("Invalid methylation call value: {x}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let data = Array2::from_shape_vec((self.rows, self.cols), values)
            .change_context(MatrixIoError)
            .attach_printable_lazy(|| {
                format!(
                    "Matrix values don't match the stated shape of {} x {}",
                    self.rows, self.cols
                )
            })?;

        Ok(StoredMatrix {
            bin: self.bin,
            matrix: CleanMatrix::from_array(data),
        })
    }
}

/// A clean matrix read from a matrix file, with its bin label if one was stored
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMatrix {
    pub bin: Option<BinId>,
    pub matrix: CleanMatrix,
}

impl AsRef<CleanMatrix> for StoredMatrix {
    fn as_ref(&self) -> &CleanMatrix {
        &self.matrix
    }
}

fn create_writer(filename: &str) -> Result<BufWriter<File>, Report<MatrixIoError>> {
    let file = File::create(filename)
        .change_context(MatrixIoError)
        .attach_printable_lazy(|| format!("Can't create matrix file '{filename}'"))?;
    Ok(BufWriter::new(file))
}

fn write_record<T: serde::Serialize>(
    writer: &mut BufWriter<File>,
    record: &T,
    filename: &str,
) -> Result<(), Report<MatrixIoError>> {
    serde_json::to_writer(&mut *writer, record)
        .change_context(MatrixIoError)
        .attach_printable_lazy(|| format!("Can't write to matrix file '{filename}'"))?;
    writeln!(writer)
        .change_context(MatrixIoError)
        .attach_printable_lazy(|| format!("Can't write to matrix file '{filename}'"))
}

/// Write clean matrices, each with an optional bin label, to a new matrix file
///
/// Returns the number of matrices written.
///
pub fn write_matrix_file<'a, I>(filename: &str, matrices: I) -> Result<usize, Report<MatrixIoError>>
where
    I: IntoIterator<Item = (Option<&'a BinId>, &'a CleanMatrix)>,
{
    info!("Writing matrices to file: '{filename}'");

    let mut writer = create_writer(filename)?;
    let mut count = 0;
    for (bin, matrix) in matrices {
        write_record(&mut writer, &BinMatrixRecord::new(bin, matrix), filename)?;
        count += 1;
    }
    writer
        .flush()
        .change_context(MatrixIoError)
        .attach_printable_lazy(|| format!("Can't write to matrix file '{filename}'"))?;
    Ok(count)
}

/// Open a matrix file and iterate over its matrices in file order
///
/// Records are parsed as the iterator is advanced. A record with an invalid shape or call value is
/// returned as an error and iteration continues with the next record. A JSON syntax error is
/// returned as an error and ends iteration.
///
pub fn read_matrix_file(
    filename: &str,
) -> Result<impl Iterator<Item = Result<StoredMatrix, Report<MatrixIoError>>>, Report<MatrixIoError>>
{
    info!("Reading matrices from file: '{filename}'");

    let file = File::open(filename)
        .change_context(MatrixIoError)
        .attach_printable_lazy(|| format!("Can't open matrix file '{filename}'"))?;

    let filename = filename.to_string();
    let records =
        serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter::<BinMatrixRecord>();
    Ok(records.enumerate().map(
        move |(index, record)| -> Result<StoredMatrix, Report<MatrixIoError>> {
            let location = || format!("Record {} of matrix file '{}'", index + 1, filename);
            record
                .change_context(MatrixIoError)
                .attach_printable_lazy(location)?
                .into_stored_matrix()
                .attach_printable_lazy(location)
        },
    ))
}

#[derive(Serialize)]
struct ImputedMatrixRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    bin: Option<&'a BinId>,
    rows: usize,
    cols: usize,
    values: Vec<Option<f32>>,
    called: bool,
    inferred: bool,
}

/// Writes imputation stream output to a matrix file, one record per matrix
///
pub struct ImputedMatrixWriter {
    filename: String,
    writer: BufWriter<File>,
    record_count: usize,
}

impl ImputedMatrixWriter {
    pub fn new(filename: &str) -> Result<Self, Report<MatrixIoError>> {
        info!("Writing imputed matrices to file: '{filename}'");
        Ok(Self {
            filename: filename.to_string(),
            writer: create_writer(filename)?,
            record_count: 0,
        })
    }

    pub fn write_matrix(
        &mut self,
        bin: Option<&BinId>,
        matrix: &StreamMatrix,
        inferred: bool,
    ) -> Result<(), Report<MatrixIoError>> {
        let (rows, cols) = matrix.dim();
        let (values, called): (Vec<Option<f32>>, bool) = match matrix {
            StreamMatrix::Imputed(x) => (
                x.iter()
                    .map(|&v| if v.is_finite() { Some(v) } else { None })
                    .collect(),
                false,
            ),
            StreamMatrix::Called(x) => (x.iter().map(|c| c.value()).collect(), true),
        };
        let record = ImputedMatrixRecord {
            bin,
            rows,
            cols,
            values,
            called,
            inferred,
        };
        write_record(&mut self.writer, &record, &self.filename)?;
        self.record_count += 1;
        Ok(())
    }

    /// Flush all output and return the number of matrices written
    pub fn finish(mut self) -> Result<usize, Report<MatrixIoError>> {
        let filename = &self.filename;
        self.writer
            .flush()
            .change_context(MatrixIoError)
            .attach_printable_lazy(|| format!("Can't write to matrix file '{filename}'"))?;
        Ok(self.record_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imputation::ImputationStream;
    use crate::site_frequency_model::SiteFrequencyBackend;
    use crate::trainer::train_model;
    use ndarray::array;

    fn test_matrices() -> Vec<(Option<BinId>, CleanMatrix)> {
        vec![
            (
                Some(BinId::new("chr1_alt", 300)),
                CleanMatrix::from_array(array![[1, MISSING_CALL], [0, 1], [1, 1]]),
            ),
            (None, CleanMatrix::from_array(array![[0, 0]])),
        ]
    }

    fn write_test_matrices(filename: &str) {
        let matrices = test_matrices();
        let count = write_matrix_file(
            filename,
            matrices.iter().map(|(bin, matrix)| (bin.as_ref(), matrix)),
        )
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_matrix_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("test.matrices.jsonl");
        let filename = filename.to_str().unwrap();
        write_test_matrices(filename);

        let content = std::fs::read_to_string(filename).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            r#"{"bin":"chr1_alt_300","rows":3,"cols":2,"values":[1,-1,0,1,1,1]}"#
        );
        assert_eq!(lines[1], r#"{"rows":1,"cols":2,"values":[0,0]}"#);

        let stored = read_matrix_file(filename)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let expected = test_matrices()
            .into_iter()
            .map(|(bin, matrix)| StoredMatrix { bin, matrix })
            .collect::<Vec<_>>();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_read_malformed_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("bad.matrices.jsonl");
        std::fs::write(
            &filename,
            concat!(
                r#"{"rows":1,"cols":2,"values":[0,1]}"#,
                "\n",
                r#"{"rows":2,"cols":2,"values":[0,1]}"#,
                "\n",
                r#"{"rows":1,"cols":1,"values":[2]}"#,
                "\n"
            ),
        )
        .unwrap();

        let results = read_matrix_file(filename.to_str().unwrap())
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_err());
    }

    #[test]
    fn test_read_matrix_file_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("bad.matrices.jsonl");
        std::fs::write(
            &filename,
            concat!(
                r#"{"rows":1,"cols":2,"values":[0,1]}"#,
                "\n",
                r#"{"rows":1,"cols":2,"values":[0,"#,
                "\n",
                r#"{"rows":1,"cols":2,"values":[1,1]}"#,
                "\n"
            ),
        )
        .unwrap();

        let results = read_matrix_file(filename.to_str().unwrap())
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_missing_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("missing.jsonl");
        assert!(read_matrix_file(filename.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_impute_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let matrix_filename = dir.path().join("test.matrices.jsonl");
        let matrix_filename = matrix_filename.to_str().unwrap();
        write_test_matrices(matrix_filename);

        let training_matrices = read_matrix_file(matrix_filename)
            .unwrap()
            .map(|x| x.map(|x| x.matrix))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let model_dir = dir.path().join("models");
        train_model(&SiteFrequencyBackend, 2, &model_dir, &training_matrices).unwrap();

        let stored = read_matrix_file(matrix_filename)
            .unwrap()
            .map(|x| x.unwrap());
        let stream =
            ImputationStream::new(&SiteFrequencyBackend, &model_dir, 2, stored, false).unwrap();

        let output_filename = dir.path().join("test.imputed.jsonl");
        let mut writer = ImputedMatrixWriter::new(output_filename.to_str().unwrap()).unwrap();
        for item in stream {
            let item = item.unwrap();
            writer
                .write_matrix(item.source.bin.as_ref(), &item.matrix, item.inferred)
                .unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 2);

        let content = std::fs::read_to_string(output_filename).unwrap();
        let records = content
            .lines()
            .map(|x| serde_json::from_str::<serde_json::Value>(x).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["bin"], "chr1_alt_300");
        assert_eq!(records[0]["inferred"], true);
        assert_eq!(records[0]["called"], false);

        // Column 1 has 2 methylated of 3 observed calls
        let imputed_value = records[0]["values"][1].as_f64().unwrap();
        approx::assert_ulps_eq!(imputed_value as f32, 0.6, max_ulps = 4);

        assert!(records[1].get("bin").is_none());
        assert_eq!(records[1]["inferred"], false);
    }

    #[test]
    fn test_write_called_matrix() {
        use crate::postprocess::SiteCall::*;

        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("test.imputed.jsonl");
        let mut writer = ImputedMatrixWriter::new(filename.to_str().unwrap()).unwrap();
        let bin = BinId::new("chr2", 100);
        writer
            .write_matrix(
                Some(&bin),
                &StreamMatrix::Called(array![[Methylated, Undetermined, Unmethylated]]),
                true,
            )
            .unwrap();
        writer
            .write_matrix(None, &StreamMatrix::Imputed(array![[0.5, f32::NAN]]), true)
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let content = std::fs::read_to_string(filename).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            r#"{"bin":"chr2_100","rows":1,"cols":3,"values":[1.0,null,0.0],"called":true,"inferred":true}"#
        );
        assert_eq!(
            lines[1],
            r#"{"rows":1,"cols":2,"values":[0.5,null],"called":false,"inferred":true}"#
        );
    }
}
