use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use cardiomegaly::{
    logger::install_logger,
    training::{self, ExperimentPaths, TrainingConfig, TrainingError},
};
use std::path::Path;

const TRAIN_ROOT: &str = "data/train";
const TEST_ROOT: &str = "data/test";
const ARTIFACT_DIR: &str = "/tmp/cardiomegaly";
const IMAGE_SIZE: usize = 224;

fn main() -> Result<(), TrainingError> {
    let artifact_dir = Path::new(ARTIFACT_DIR);
    std::fs::create_dir_all(artifact_dir).map_err(|source| TrainingError::Artifact {
        path: artifact_dir.to_path_buf(),
        source,
    })?;
    install_logger(Some(&artifact_dir.join("experiment.log")));

    let paths = ExperimentPaths::new(TRAIN_ROOT, TEST_ROOT).with_artifact_dir(artifact_dir);
    let config = TrainingConfig::binary(IMAGE_SIZE, IMAGE_SIZE);

    let evaluation = training::run::<Autodiff<NdArray>>(config, &paths, NdArrayDevice::Cpu)?;
    println!("{evaluation}");

    Ok(())
}
