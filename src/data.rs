use crate::dataset::ImageItem;
use burn::{data::dataloader::batcher::Batcher, prelude::*};
use std::marker::PhantomData;

/// Stacks [image items](ImageItem) into channel-first batches.
#[derive(Clone, Debug)]
pub struct ClassificationBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// Images with shape `[batch_size, 3, height, width]`.
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Default for ClassificationBatcher<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Batcher<B, ImageItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ClassificationBatch<B> {
        let batch_size = items.len();
        let [height, width, channels] = items
            .first()
            .map(|item| item.image.shape())
            .unwrap_or([0, 0, 0]);

        let targets = items
            .iter()
            .map(|item| (item.label as i64).elem::<B::IntElem>())
            .collect::<Vec<_>>();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [batch_size]),
            device,
        );

        let mut pixels = Vec::with_capacity(batch_size * height * width * channels);
        for item in items {
            pixels.extend(item.image.into_pixels());
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, height, width, channels])
                .convert::<B::FloatElem>(),
            device,
        )
        // [N, H, W, C] -> [N, C, H, W]
        .permute([0, 3, 1, 2]);

        ClassificationBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageFolderDataset;
    use crate::loader::{tests::write_jpeg, ImageSize};
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn batch_is_channel_first() {
        let dir = TempDir::new().unwrap();
        for class in ["a", "b"] {
            std::fs::create_dir(dir.path().join(class)).unwrap();
            write_jpeg(&dir.path().join(class).join("0.jpg"), 30, 30);
        }
        let dataset = ImageFolderDataset::new(dir.path(), ImageSize::new(8, 6)).unwrap();
        let items = (0..dataset.len())
            .filter_map(|i| dataset.get(i))
            .collect::<Vec<_>>();
        let first = items[0].image.clone();

        let device: <TestBackend as Backend>::Device = Default::default();
        let batch = ClassificationBatcher::<TestBackend>::new().batch(items, &device);

        assert_eq!(batch.images.dims(), [2, 3, 6, 8]);
        assert_eq!(
            batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            vec![0, 1]
        );

        // Red channel of the first pixel survives the permutation.
        let red = batch
            .images
            .slice([0..1, 0..1, 0..1, 0..1])
            .into_scalar()
            .elem::<f32>();
        assert_eq!(red, first.pixels()[0]);
    }
}
