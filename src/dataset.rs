use crate::loader::{load_image, ImageLoaderError, ImageSize, ImageTensor, CHANNELS};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for [ImageFolderDataset](ImageFolderDataset) construction.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The dataset root does not exist or is not a directory.
    #[error("Dataset root `{0}` is not a directory")]
    NotADirectory(PathBuf),

    /// Listing a directory failed.
    #[error("I/O error while listing `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A subdirectory name has no entry in the class index.
    #[error("Class `{name}` found in `{root}` is not part of the class index")]
    UnknownClass { root: PathBuf, name: String },

    /// The root has no class subdirectory.
    #[error("No class directories found in `{0}`")]
    EmptyClassIndex(PathBuf),

    /// One of the images failed validation.
    #[error(transparent)]
    Image(#[from] ImageLoaderError),
}

/// Mapping from class directory name to label.
///
/// Names are sorted lexicographically so that two roots with the same class
/// directories always produce the same labels. Serialized as the plain list of
/// names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    /// Build the index from a list of class names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        Self {
            names: names.into_iter().collect(),
        }
    }

    /// Build the index from the immediate subdirectories of `root`.
    pub fn scan<P: AsRef<Path>>(root: P) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let names = class_directories(root)?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();

        if names.is_empty() {
            return Err(DatasetError::EmptyClassIndex(root.to_path_buf()));
        }

        Ok(Self::from_names(names))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Label of the class named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok()
    }
}

impl From<Vec<String>> for ClassIndex {
    fn from(names: Vec<String>) -> Self {
        Self::from_names(names)
    }
}

impl From<ClassIndex> for Vec<String> {
    fn from(classes: ClassIndex) -> Self {
        classes.names
    }
}

/// A labeled image, decoded on access.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageItem {
    pub image: ImageTensor,
    pub label: usize,
}

#[derive(Debug, Clone)]
struct ImageItemRaw {
    path: PathBuf,
    label: usize,
}

/// The whole dataset loaded in memory.
#[derive(Debug, Clone)]
pub struct LabeledImages<B: Backend> {
    /// Images with shape `[N, height, width, 3]`.
    pub images: Tensor<B, 4>,
    /// Labels with shape `[N]`.
    pub labels: Tensor<B, 1, Int>,
}

/// Image classification dataset read from a folder with one subdirectory per class.
///
/// Only paths and labels are kept; images are decoded when an item is fetched.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    items: Vec<ImageItemRaw>,
    classes: ClassIndex,
    size: ImageSize,
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let item = self.items.get(index)?;
        // Every file was loaded once when the dataset was built.
        let image = load_image(&item.path, self.size).unwrap_or_else(|err| {
            log::error!("Failed to load a validated image: {err}");
            panic!("{err}")
        });

        Some(ImageItem {
            image,
            label: item.label,
        })
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl ImageFolderDataset {
    /// Create a dataset whose classes are the subdirectories of `root`.
    pub fn new<P: AsRef<Path>>(root: P, size: ImageSize) -> Result<Self, DatasetError> {
        let classes = ClassIndex::scan(root.as_ref())?;
        Self::with_classes(root, classes, size)
    }

    /// Create a dataset labeled with an existing class index.
    ///
    /// Classes without a directory under `root` contribute no samples.
    /// Every file is loaded once at `size` and dropped, so a single file that
    /// cannot be decoded fails the whole build instead of a later fetch.
    pub fn with_classes<P: AsRef<Path>>(
        root: P,
        classes: ClassIndex,
        size: ImageSize,
    ) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let directories: HashMap<String, PathBuf> = class_directories(root)?.into_iter().collect();

        if let Some(name) = directories.keys().find(|n| classes.index_of(n).is_none()) {
            return Err(DatasetError::UnknownClass {
                root: root.to_path_buf(),
                name: name.clone(),
            });
        }

        let mut items = Vec::new();
        for (label, name) in classes.names().iter().enumerate() {
            let Some(dir) = directories.get(name) else {
                log::warn!(
                    "Class `{name}` has no directory in `{}`, it contributes no samples",
                    root.display()
                );
                continue;
            };

            let files = class_files(dir)?;
            log::info!("Class {label} `{name}`: {} images", files.len());

            for path in files {
                load_image(&path, size)?;
                items.push(ImageItemRaw { path, label });
            }
        }

        Ok(Self {
            items,
            classes,
            size,
        })
    }

    pub fn classes(&self) -> &ClassIndex {
        &self.classes
    }

    pub fn image_size(&self) -> ImageSize {
        self.size
    }

    /// Labels of all samples, in dataset order.
    pub fn labels(&self) -> Vec<usize> {
        self.items.iter().map(|item| item.label).collect()
    }

    /// Paths of all samples, in dataset order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.items.iter().map(|item| item.path.as_path())
    }

    /// Decode every image and stack them into a single in-memory batch.
    pub fn materialize<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<LabeledImages<B>, ImageLoaderError> {
        let num_items = self.items.len();
        let mut pixels = Vec::with_capacity(num_items * self.size.num_values());
        for item in self.items.iter() {
            pixels.extend(load_image(&item.path, self.size)?.into_pixels());
        }

        let shape = [
            num_items,
            self.size.height as usize,
            self.size.width as usize,
            CHANNELS,
        ];
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, shape).convert::<B::FloatElem>(),
            device,
        );

        let labels = self
            .items
            .iter()
            .map(|item| item.label as i64)
            .collect::<Vec<_>>();
        let labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [num_items]).convert::<B::IntElem>(),
            device,
        );

        Ok(LabeledImages { images, labels })
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_error = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = fs::read_dir(dir)
        .map_err(io_error)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    paths.sort();

    Ok(paths)
}

/// Immediate subdirectories of `root` as `(name, path)` pairs.
fn class_directories(root: &Path) -> Result<Vec<(String, PathBuf)>, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::NotADirectory(root.to_path_buf()));
    }

    Ok(read_dir_sorted(root)?
        .into_iter()
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            Some((name, path))
        })
        .collect())
}

fn class_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|path| path.is_file())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{write_gray_jpeg, write_jpeg};
    use burn::backend::NdArray;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    const SIZE: ImageSize = ImageSize {
        width: 16,
        height: 12,
    };

    fn populate(root: &Path, classes: &[(&str, usize)]) {
        for (name, count) in classes {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                write_jpeg(&dir.join(format!("{i}.jpg")), 20 + i as u32, 20);
            }
        }
    }

    /// Root with classes `a` (2 images) and `b` (3 images).
    #[fixture]
    fn two_classes() -> TempDir {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), &[("a", 2), ("b", 3)]);
        dir
    }

    #[test]
    fn class_index_is_sorted() {
        let classes = ClassIndex::from_names(["no_cardiomegaly", "cardiomegaly"]);

        assert_eq!(classes.names(), ["cardiomegaly", "no_cardiomegaly"]);
        assert_eq!(classes.index_of("cardiomegaly"), Some(0));
        assert_eq!(classes.index_of("no_cardiomegaly"), Some(1));
        assert_eq!(classes.index_of("other"), None);
    }

    #[test]
    fn deserialized_class_index_is_sorted() {
        let classes: ClassIndex =
            serde_json::from_str(r#"["no_cardiomegaly", "cardiomegaly", "cardiomegaly"]"#)
                .unwrap();

        assert_eq!(classes.names(), ["cardiomegaly", "no_cardiomegaly"]);
        assert_eq!(classes.index_of("no_cardiomegaly"), Some(1));
        assert_eq!(
            serde_json::to_string(&classes).unwrap(),
            r#"["cardiomegaly","no_cardiomegaly"]"#
        );
    }

    #[rstest]
    fn labels_follow_class_order(two_classes: TempDir) {
        let dataset = ImageFolderDataset::new(two_classes.path(), SIZE).unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.labels(), vec![0, 0, 1, 1, 1]);
        assert_eq!(dataset.classes().names(), ["a", "b"]);
    }

    #[rstest]
    fn items_are_decoded_on_access(two_classes: TempDir) {
        let dataset = ImageFolderDataset::new(two_classes.path(), SIZE).unwrap();

        let item = dataset.get(4).unwrap();

        assert_eq!(item.label, 1);
        assert_eq!(item.image.shape(), [12, 16, 3]);
        assert_eq!(dataset.get(5), None);
    }

    #[test]
    fn empty_class_keeps_following_labels() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), &[("a", 1), ("b", 0), ("c", 2)]);

        let dataset = ImageFolderDataset::new(dir.path(), SIZE).unwrap();

        assert_eq!(dataset.classes().len(), 3);
        assert_eq!(dataset.labels(), vec![0, 2, 2]);
    }

    #[rstest]
    fn missing_class_directory_contributes_nothing(two_classes: TempDir) {
        let test = TempDir::new().unwrap();
        populate(test.path(), &[("a", 2)]);
        let classes = ClassIndex::scan(two_classes.path()).unwrap();

        let dataset = ImageFolderDataset::with_classes(test.path(), classes, SIZE).unwrap();

        assert_eq!(dataset.labels(), vec![0, 0]);
    }

    #[rstest]
    fn unknown_class_directory_is_rejected(two_classes: TempDir) {
        let test = TempDir::new().unwrap();
        populate(test.path(), &[("a", 1), ("z", 1)]);
        let classes = ClassIndex::scan(two_classes.path()).unwrap();

        let result = ImageFolderDataset::with_classes(test.path(), classes, SIZE);

        assert!(matches!(result, Err(DatasetError::UnknownClass { name, .. }) if name == "z"));
    }

    #[rstest]
    fn invalid_file_fails_the_build(two_classes: TempDir) {
        fs::write(two_classes.path().join("a").join("readme.txt"), "notes").unwrap();

        let result = ImageFolderDataset::new(two_classes.path(), SIZE);

        assert!(matches!(result, Err(DatasetError::Image(_))));
    }

    #[rstest]
    fn grayscale_images_are_accepted(two_classes: TempDir) {
        write_gray_jpeg(&two_classes.path().join("b").join("xray.jpg"), 30, 24);

        let dataset = ImageFolderDataset::new(two_classes.path(), SIZE).unwrap();

        assert_eq!(dataset.labels(), vec![0, 0, 1, 1, 1, 1]);
        let item = (0..dataset.len())
            .zip(dataset.paths())
            .find(|(_, path)| path.ends_with("xray.jpg"))
            .and_then(|(index, _)| dataset.get(index))
            .unwrap();
        assert_eq!(item.image.shape(), [12, 16, 3]);
        assert_eq!(item.label, 1);
    }

    #[rstest]
    fn unloadable_target_size_fails_the_build(two_classes: TempDir) {
        let result = ImageFolderDataset::new(two_classes.path(), ImageSize::new(16, 0));

        assert!(matches!(
            result,
            Err(DatasetError::Image(ImageLoaderError::InvalidTargetSize { .. }))
        ));
    }

    #[test]
    fn missing_root_is_rejected() {
        let dir = TempDir::new().unwrap();

        let result = ImageFolderDataset::new(dir.path().join("missing"), SIZE);

        assert!(matches!(result, Err(DatasetError::NotADirectory(_))));
    }

    #[test]
    fn root_without_classes_is_rejected() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            ClassIndex::scan(dir.path()),
            Err(DatasetError::EmptyClassIndex(_))
        ));
    }

    #[rstest]
    fn materialized_dataset_has_parallel_arrays(two_classes: TempDir) {
        let device = Default::default();
        let dataset = ImageFolderDataset::new(two_classes.path(), SIZE).unwrap();

        let loaded = dataset.materialize::<TestBackend>(&device).unwrap();

        assert_eq!(loaded.images.dims(), [5, 12, 16, 3]);
        assert_eq!(loaded.labels.dims(), [5]);
        assert_eq!(
            loaded.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            vec![0, 0, 1, 1, 1]
        );
    }
}
