//! Lazy imputation of a stream of clean matrices with a single density-specific model
//!

use std::path::Path;

use error_stack::Report;
use log::info;

use crate::matrix::{CleanMatrix, ImputedMatrix};
use crate::model::{get_model_path, ImputationModel, InferenceError, ModelLoadError, ModelLoader};
use crate::postprocess::{threshold_matrix, CalledMatrix};

/// Output matrix of the imputation stream
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMatrix {
    Imputed(ImputedMatrix),
    Called(CalledMatrix),
}

impl StreamMatrix {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            StreamMatrix::Imputed(x) => x.dim(),
            StreamMatrix::Called(x) => x.dim(),
        }
    }
}

/// One processed element of the imputation stream
pub struct StreamItem<T> {
    /// The input element, moved through the stream so that any label it carries is retained
    pub source: T,

    pub matrix: StreamMatrix,

    /// True if the model was run on this element
    pub inferred: bool,
}

/// Single-pass iterator imputing each input matrix in order
///
/// The model for the stream's CpG density is loaded once, when the stream is created. Each call
/// to `next` pulls one matrix from the input, runs the model only if the matrix has a missing
/// call, and optionally thresholds the result into site calls. Matrices without missing calls are
/// passed through without running the model.
///
/// Input elements can be any type holding a [CleanMatrix].
///
pub struct ImputationStream<I, M> {
    matrices: I,
    model: M,
    cpg_density: usize,
    postprocess: bool,
}

impl<I, M> ImputationStream<I, M>
where
    I: Iterator,
    I::Item: AsRef<CleanMatrix>,
    M: ImputationModel,
{
    /// Load the model for `cpg_density` from `model_dir` and set up the stream over `matrices`
    ///
    /// Fails immediately if the model does not exist or can't be loaded.
    ///
    pub fn new<L>(
        loader: &L,
        model_dir: &Path,
        cpg_density: usize,
        matrices: I,
        postprocess: bool,
    ) -> Result<Self, Report<ModelLoadError>>
    where
        L: ModelLoader<Model = M>,
    {
        let model_path = get_model_path(model_dir, cpg_density, loader.model_extension());
        if !model_path.exists() {
            return Err(Report::new(ModelLoadError { cpg_density }).attach_printable(format!(
                "No model file found at '{}'",
                model_path.display()
            )));
        }

        info!(
            "Loading imputation model for {} CpG bins from '{}'",
            cpg_density,
            model_path.display()
        );
        let model = loader.load(&model_path, cpg_density)?;

        Ok(Self {
            matrices,
            model,
            cpg_density,
            postprocess,
        })
    }

    fn process_matrix(
        &mut self,
        matrix: &CleanMatrix,
    ) -> Result<(StreamMatrix, bool), Report<InferenceError>> {
        let (imputed, inferred) = if matrix.has_missing() {
            let imputed = self.model.impute(matrix)?;
            if imputed.dim() != matrix.data().dim() {
                return Err(Report::new(InferenceError).attach_printable(format!(
                    "Model output shape {:?} does not match input shape {:?}",
                    imputed.dim(),
                    matrix.data().dim()
                )));
            }
            (imputed, true)
        } else {
            (matrix.data().mapv(|x| x as f32), false)
        };

        let output = if self.postprocess {
            StreamMatrix::Called(threshold_matrix(&imputed))
        } else {
            StreamMatrix::Imputed(imputed)
        };
        Ok((output, inferred))
    }
}

impl<I, M> Iterator for ImputationStream<I, M>
where
    I: Iterator,
    I::Item: AsRef<CleanMatrix>,
    M: ImputationModel,
{
    type Item = Result<StreamItem<I::Item>, Report<InferenceError>>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.matrices.next()?;
        let result = match self.process_matrix(source.as_ref()) {
            Ok((matrix, inferred)) => Ok(StreamItem {
                source,
                matrix,
                inferred,
            }),
            Err(err) => {
                let input = source.as_ref();
                Err(err.attach_printable(format!(
                    "Input matrix: {} reads x {} CpGs, model for {} CpG bins",
                    input.nrows(),
                    input.ncols(),
                    self.cpg_density
                )))
            }
        };
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.matrices.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{MISSING_CALL, MODEL_MISSING_VALUE};
    use crate::postprocess::SiteCall;
    use ndarray::array;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Fills every missing call with a fixed value and counts model invocations
    struct MockModel {
        fill_value: f32,
        inference_count: Rc<Cell<usize>>,
    }

    impl ImputationModel for MockModel {
        fn impute(
            &mut self,
            matrix: &CleanMatrix,
        ) -> Result<ImputedMatrix, Report<InferenceError>> {
            self.inference_count.set(self.inference_count.get() + 1);
            if self.fill_value < 0.0 {
                return Err(Report::new(InferenceError));
            }
            Ok(matrix.model_input().mapv(|x| {
                if x == MODEL_MISSING_VALUE {
                    self.fill_value
                } else {
                    x
                }
            }))
        }
    }

    struct MockLoader {
        fill_value: f32,
        load_count: Cell<usize>,
        inference_count: Rc<Cell<usize>>,
    }

    impl MockLoader {
        fn new(fill_value: f32) -> Self {
            Self {
                fill_value,
                load_count: Cell::new(0),
                inference_count: Rc::new(Cell::new(0)),
            }
        }
    }

    impl ModelLoader for MockLoader {
        type Model = MockModel;

        fn model_extension(&self) -> &str {
            ".mock"
        }

        fn load(&self, _: &Path, _: usize) -> Result<Self::Model, Report<ModelLoadError>> {
            self.load_count.set(self.load_count.get() + 1);
            Ok(MockModel {
                fill_value: self.fill_value,
                inference_count: self.inference_count.clone(),
            })
        }
    }

    /// Model directory with an (empty) mock model file for the given densities
    fn get_model_dir(cpg_densities: &[usize]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for &cpg_density in cpg_densities {
            std::fs::File::create(get_model_path(dir.path(), cpg_density, ".mock")).unwrap();
        }
        dir
    }

    fn complete_matrix() -> CleanMatrix {
        CleanMatrix::from_array(array![[1, 0, 1], [0, 0, 1]])
    }

    fn incomplete_matrix() -> CleanMatrix {
        CleanMatrix::from_array(array![[1, MISSING_CALL, 1], [0, 0, MISSING_CALL]])
    }

    #[test]
    fn test_complete_matrix_skips_inference() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(0.9);
        let matrix = complete_matrix();

        let stream =
            ImputationStream::new(&loader, model_dir.path(), 3, vec![matrix.clone()].into_iter(), false)
                .unwrap();
        let items = stream.collect::<Result<Vec<_>, _>>().unwrap();

        assert_eq!(items.len(), 1);
        assert!(!items[0].inferred);
        assert_eq!(
            items[0].matrix,
            StreamMatrix::Imputed(matrix.data().mapv(|x| x as f32))
        );
        assert_eq!(items[0].source, matrix);
        assert_eq!(loader.inference_count.get(), 0);
    }

    #[test]
    fn test_incomplete_matrix_is_imputed() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(0.5);

        let stream = ImputationStream::new(
            &loader,
            model_dir.path(),
            3,
            vec![incomplete_matrix()].into_iter(),
            false,
        )
        .unwrap();
        let items = stream.collect::<Result<Vec<_>, _>>().unwrap();

        assert!(items[0].inferred);
        assert_eq!(
            items[0].matrix,
            StreamMatrix::Imputed(array![[1.0, 0.5, 1.0], [0.0, 0.0, 0.5]])
        );
        assert_eq!(loader.inference_count.get(), 1);
    }

    #[test]
    fn test_postprocess() {
        let model_dir = get_model_dir(&[3]);
        let matrices = vec![incomplete_matrix(), complete_matrix()];

        use SiteCall::*;

        let loader = MockLoader::new(0.85);
        let mut stream =
            ImputationStream::new(&loader, model_dir.path(), 3, matrices.clone().into_iter(), true)
                .unwrap();
        let item = stream.next().unwrap().unwrap();
        assert_eq!(
            item.matrix,
            StreamMatrix::Called(array![
                [Methylated, Methylated, Methylated],
                [Unmethylated, Unmethylated, Methylated]
            ])
        );

        // Postprocessing doesn't change the observed calls of a complete matrix
        let item = stream.next().unwrap().unwrap();
        assert!(!item.inferred);
        assert_eq!(
            item.matrix,
            StreamMatrix::Called(array![
                [Methylated, Unmethylated, Methylated],
                [Unmethylated, Unmethylated, Methylated]
            ])
        );
        assert!(stream.next().is_none());

        let loader = MockLoader::new(0.5);
        let stream =
            ImputationStream::new(&loader, model_dir.path(), 3, matrices.into_iter(), true)
                .unwrap();
        let items = stream.collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(
            items[0].matrix,
            StreamMatrix::Called(array![
                [Methylated, Undetermined, Methylated],
                [Unmethylated, Unmethylated, Undetermined]
            ])
        );
    }

    #[test]
    fn test_model_loaded_once() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(0.5);
        let matrices = (0..10).map(|i| {
            if i % 2 == 0 {
                incomplete_matrix()
            } else {
                complete_matrix()
            }
        });

        let stream = ImputationStream::new(&loader, model_dir.path(), 3, matrices, true).unwrap();
        assert_eq!(loader.load_count.get(), 1);

        let mut pulled = 0;
        for item in stream {
            item.unwrap();
            pulled += 1;
        }
        assert_eq!(pulled, 10);
        assert_eq!(loader.load_count.get(), 1);
        assert_eq!(loader.inference_count.get(), 5);
    }

    #[test]
    fn test_stream_is_lazy() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(0.5);
        let pulled = Cell::new(0);
        let matrices = std::iter::repeat_with(|| {
            pulled.set(pulled.get() + 1);
            incomplete_matrix()
        });

        let mut stream =
            ImputationStream::new(&loader, model_dir.path(), 3, matrices, false).unwrap();
        assert_eq!(pulled.get(), 0);

        stream.next().unwrap().unwrap();
        stream.next().unwrap().unwrap();
        assert_eq!(pulled.get(), 2);
        assert_eq!(loader.inference_count.get(), 2);
    }

    #[test]
    fn test_missing_model() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(0.5);

        let result = ImputationStream::new(
            &loader,
            model_dir.path(),
            5,
            vec![complete_matrix()].into_iter(),
            true,
        );
        let err = result.err().unwrap();
        assert_eq!(err.current_context().cpg_density, 5);
        assert_eq!(loader.load_count.get(), 0);
    }

    #[test]
    fn test_inference_failure_continues() {
        let model_dir = get_model_dir(&[3]);
        let loader = MockLoader::new(-1.0);
        let matrices = vec![incomplete_matrix(), complete_matrix()];

        let stream =
            ImputationStream::new(&loader, model_dir.path(), 3, matrices.into_iter(), false)
                .unwrap();
        let results = stream.collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }
}
