use crate::{
    data::{ClassificationBatch, ClassificationBatcher},
    dataset::{ClassIndex, DatasetError, ImageFolderDataset, ImageItem},
    loader::ImageSize,
    model::{Model, ModelConfig, ModelError},
};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainStep, ValidStep},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Name of the loss entry of an [Evaluation](Evaluation).
pub const LOSS: &str = "loss";
/// Name of the accuracy entry of an [Evaluation](Evaluation).
pub const ACCURACY: &str = "accuracy";
/// Printed instead of the metrics when an evaluation does not hold both of them.
pub const MISSING_METRICS: &str = "Evaluation results do not contain the expected metrics.";

/// How the fit and evaluation loops split a dataset into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// The whole dataset is a single batch.
    FullDataset,
    /// Batches of at most this many samples.
    Size(usize),
}

impl BatchPolicy {
    pub fn batch_size(&self, num_items: usize) -> usize {
        match self {
            BatchPolicy::FullDataset => num_items,
            BatchPolicy::Size(size) => *size,
        }
        .max(1)
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 3)]
    pub num_epochs: usize,
    #[config(default = "BatchPolicy::FullDataset")]
    pub batching: BatchPolicy,
    /// Seed of the per-epoch shuffling.
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
}

impl TrainingConfig {
    /// Adam with a 1e-3 learning rate on a `height`x`width` two-class problem.
    pub fn binary(height: usize, width: usize) -> Self {
        Self::new(
            ModelConfig::new(2, height, width),
            AdamConfig::new().with_epsilon(1e-7),
        )
    }

    pub fn image_size(&self) -> ImageSize {
        ImageSize::new(self.model.width as u32, self.model.height as u32)
    }
}

/// Where the datasets are read from and where the artifacts are written.
#[derive(Debug, Clone)]
pub struct ExperimentPaths {
    pub train_root: PathBuf,
    pub test_root: PathBuf,
    pub artifact_dir: Option<PathBuf>,
}

impl ExperimentPaths {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(train_root: P, test_root: Q) -> Self {
        Self {
            train_root: train_root.into(),
            test_root: test_root.into(),
            artifact_dir: None,
        }
    }

    pub fn with_artifact_dir<P: Into<PathBuf>>(mut self, artifact_dir: P) -> Self {
        self.artifact_dir = Some(artifact_dir.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Failed to build the {split} dataset: {source}")]
    Dataset {
        split: &'static str,
        #[source]
        source: DatasetError,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("The model expects {expected} classes but `{root}` has {found}")]
    ClassCount {
        root: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("No training images found in `{0}`")]
    EmptyTrainingSet(PathBuf),

    #[error("Failed to write artifact `{path}`: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save the model: {0}")]
    Record(String),
}

/// Mean train metrics of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// Loss and accuracy of an evaluated dataset, by metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    metrics: BTreeMap<String, f64>,
}

impl Evaluation {
    pub fn with_metric<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn loss(&self) -> Option<f64> {
        self.get(LOSS)
    }

    /// Fraction of correctly classified samples, in `[0, 1]`.
    pub fn accuracy(&self) -> Option<f64> {
        self.get(ACCURACY)
    }
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.loss(), self.accuracy()) {
            (Some(loss), Some(accuracy)) => {
                writeln!(f, "Test Loss: {loss}")?;
                write!(f, "Test Accuracy: {accuracy}")
            }
            _ => f.write_str(MISSING_METRICS),
        }
    }
}

/// Sample-weighted running loss and accuracy.
#[derive(Debug, Default)]
struct MetricAccumulator {
    loss_sum: f64,
    num_correct: usize,
    num_items: usize,
}

impl MetricAccumulator {
    fn update<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
        let [batch_size] = output.targets.dims();
        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let num_correct = output
            .output
            .clone()
            .argmax(1)
            .flatten::<1>(0, 1)
            .equal(output.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        self.loss_sum += loss * batch_size as f64;
        self.num_correct += num_correct as usize;
        self.num_items += batch_size;
    }

    fn loss(&self) -> Option<f64> {
        (self.num_items > 0).then(|| self.loss_sum / self.num_items as f64)
    }

    fn accuracy(&self) -> Option<f64> {
        (self.num_items > 0).then(|| self.num_correct as f64 / self.num_items as f64)
    }

    fn into_evaluation(self) -> Evaluation {
        let mut evaluation = Evaluation::default();
        if let Some(loss) = self.loss() {
            evaluation = evaluation.with_metric(LOSS, loss);
        }
        if let Some(accuracy) = self.accuracy() {
            evaluation = evaluation.with_metric(ACCURACY, accuracy);
        }
        evaluation
    }
}

/// Datasets and a freshly initialized model, ready to be fitted.
pub struct Experiment<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    train: ImageFolderDataset,
    test: ImageFolderDataset,
    model: Model<B>,
}

impl<B: AutodiffBackend> Experiment<B> {
    /// Build both datasets with the class index of the train root, then the model.
    pub fn build(
        config: TrainingConfig,
        paths: &ExperimentPaths,
        device: B::Device,
    ) -> Result<Self, TrainingError> {
        let size = config.image_size();
        let train_error = |source| TrainingError::Dataset {
            split: "train",
            source,
        };

        let classes = ClassIndex::scan(&paths.train_root).map_err(train_error)?;
        log::info!("Class index: {:?}", classes.names());

        if classes.len() != config.model.num_classes {
            return Err(TrainingError::ClassCount {
                root: paths.train_root.clone(),
                expected: config.model.num_classes,
                found: classes.len(),
            });
        }

        let train = ImageFolderDataset::with_classes(&paths.train_root, classes.clone(), size)
            .map_err(train_error)?;
        if train.is_empty() {
            return Err(TrainingError::EmptyTrainingSet(paths.train_root.clone()));
        }

        let test = ImageFolderDataset::with_classes(&paths.test_root, classes, size).map_err(
            |source| TrainingError::Dataset {
                split: "test",
                source,
            },
        )?;
        log::info!(
            "Loaded {} train and {} test images at {}x{}",
            train.len(),
            test.len(),
            size.width,
            size.height
        );

        let model = config.model.init::<B>(&device)?;
        log::info!("Model: {} parameters", model.num_params());

        Ok(Self {
            config,
            device,
            train,
            test,
            model,
        })
    }

    pub fn train_dataset(&self) -> &ImageFolderDataset {
        &self.train
    }

    pub fn test_dataset(&self) -> &ImageFolderDataset {
        &self.test
    }

    /// Run every epoch over the shuffled train set, updating the model in place.
    pub fn fit(self) -> TrainedExperiment<B> {
        let Self {
            config,
            device,
            train,
            test,
            mut model,
        } = self;

        let classes = train.classes().clone();
        let dataloader = train_loader::<B, _>(&config, train, &device);
        let mut optim = config.optimizer.init::<B, Model<B>>();

        let mut history = Vec::with_capacity(config.num_epochs);
        let now = Instant::now();

        for epoch in 1..config.num_epochs + 1 {
            let mut metrics = MetricAccumulator::default();

            for batch in dataloader.iter() {
                let output = TrainStep::step(&model, batch);
                metrics.update(&output.item);
                model = optim.step(config.learning_rate, model, output.grads);
            }

            let metrics = EpochMetrics {
                epoch,
                loss: metrics.loss().unwrap_or(f64::NAN),
                accuracy: metrics.accuracy().unwrap_or(f64::NAN),
            };
            log::info!(
                "Epoch {}/{} - loss {:.4} - accuracy {:.4}",
                epoch,
                config.num_epochs,
                metrics.loss,
                metrics.accuracy
            );
            history.push(metrics);
        }

        let elapsed = now.elapsed().as_secs();
        log::info!("Training completed in {}m{}s", elapsed / 60, elapsed % 60);

        TrainedExperiment {
            config,
            device,
            classes,
            test,
            model,
            history,
        }
    }
}

/// A fitted model together with the test set it is evaluated on.
pub struct TrainedExperiment<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
    classes: ClassIndex,
    test: ImageFolderDataset,
    model: Model<B>,
    history: Vec<EpochMetrics>,
}

impl<B: AutodiffBackend> TrainedExperiment<B> {
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    pub fn model(&self) -> &Model<B> {
        &self.model
    }

    /// Loss and accuracy over the whole test set, with dropout disabled.
    ///
    /// An empty test set yields an evaluation without metrics.
    pub fn evaluate(&self) -> Evaluation {
        let mut metrics = MetricAccumulator::default();

        if !self.test.is_empty() {
            let model = self.model.valid();
            let dataloader = DataLoaderBuilder::new(ClassificationBatcher::<B::InnerBackend>::new())
                .batch_size(self.config.batching.batch_size(self.test.len()))
                .set_device(self.device.clone())
                .build(self.test.clone());

            for batch in dataloader.iter() {
                metrics.update(&ValidStep::step(&model, batch));
            }
        } else {
            log::warn!("The test set is empty, nothing to evaluate");
        }

        metrics.into_evaluation()
    }

    /// Write the config, the class index and the model weights to `artifact_dir`.
    pub fn save<P: AsRef<Path>>(&self, artifact_dir: P) -> Result<(), TrainingError> {
        let artifact_dir = artifact_dir.as_ref();
        std::fs::create_dir_all(artifact_dir).map_err(artifact_error(artifact_dir))?;

        let config_path = artifact_dir.join("config.json");
        self.config
            .save(&config_path)
            .map_err(artifact_error(&config_path))?;

        let classes_path = artifact_dir.join("classes.json");
        serde_json::to_string_pretty(&self.classes)
            .map_err(std::io::Error::from)
            .and_then(|classes| std::fs::write(&classes_path, classes))
            .map_err(artifact_error(&classes_path))?;

        self.model
            .clone()
            .save_file(artifact_dir.join("model"), &CompactRecorder::new())
            .map_err(|err| TrainingError::Record(format!("{err:?}")))?;

        log::info!("Artifacts saved to `{}`", artifact_dir.display());
        Ok(())
    }
}

/// Loader over `dataset` that reshuffles the samples on every iteration.
fn train_loader<B, D>(
    config: &TrainingConfig,
    dataset: D,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, ClassificationBatch<B>>>
where
    B: Backend,
    D: Dataset<ImageItem> + 'static,
{
    DataLoaderBuilder::new(ClassificationBatcher::<B>::new())
        .batch_size(config.batching.batch_size(dataset.len()))
        .shuffle(config.seed)
        .set_device(device.clone())
        .build(dataset)
}

fn artifact_error(path: &Path) -> impl FnOnce(std::io::Error) -> TrainingError + '_ {
    move |source| TrainingError::Artifact {
        path: path.to_path_buf(),
        source,
    }
}

/// Build, fit and evaluate, then save the artifacts if an artifact directory is set.
///
/// Nothing is written when any stage fails.
pub fn run<B: AutodiffBackend>(
    config: TrainingConfig,
    paths: &ExperimentPaths,
    device: B::Device,
) -> Result<Evaluation, TrainingError> {
    let trained = Experiment::<B>::build(config, paths, device)?.fit();
    let evaluation = trained.evaluate();

    match (evaluation.loss(), evaluation.accuracy()) {
        (Some(loss), Some(accuracy)) => {
            log::info!("Evaluation - loss {loss:.4} - accuracy {accuracy:.4}")
        }
        _ => log::warn!("{MISSING_METRICS}"),
    }

    if let Some(artifact_dir) = &paths.artifact_dir {
        trained.save(artifact_dir)?;
    }

    Ok(evaluation)
}
