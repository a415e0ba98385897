use burn::tensor::TensorData;
use image::codecs::jpeg::JpegDecoder;
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, ImageDecoder};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of color channels of every loaded image.
pub const CHANNELS: usize = 3;

/// Error type for the [image loader](load_image).
#[derive(Error, Debug)]
pub enum ImageLoaderError {
    /// The file could not be opened or read.
    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a decodable JPEG.
    #[error("Could not decode `{path}` as JPEG: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The JPEG decodes to a color type that cannot be expanded to RGB.
    #[error("Expected a grayscale or RGB JPEG, `{path}` is {color:?}")]
    ChannelCount { path: PathBuf, color: ColorType },

    /// The requested output resolution has a zero dimension.
    #[error("Invalid target size {width}x{height}")]
    InvalidTargetSize { width: u32, height: u32 },
}

/// Target resolution of the loaded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of `f32` values in an image of this size.
    pub fn num_values(&self) -> usize {
        self.height as usize * self.width as usize * CHANNELS
    }

    fn validate(&self) -> Result<(), ImageLoaderError> {
        if self.width == 0 || self.height == 0 {
            return Err(ImageLoaderError::InvalidTargetSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// A decoded image, resized and normalized to `[0, 1]`.
///
/// Values are stored row-major in `(height, width, channel)` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pixels: Vec<f32>,
    height: usize,
    width: usize,
}

impl ImageTensor {
    /// Shape as `[height, width, channels]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, CHANNELS]
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<f32> {
        self.pixels
    }

    /// Convert into backend-agnostic tensor data of shape `[height, width, 3]`.
    pub fn into_data(self) -> TensorData {
        let shape = self.shape();
        TensorData::new(self.pixels, shape)
    }
}

fn open_jpeg(path: &Path) -> Result<JpegDecoder<BufReader<File>>, ImageLoaderError> {
    let file = File::open(path).map_err(|source| ImageLoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let decoder =
        JpegDecoder::new(BufReader::new(file)).map_err(|source| ImageLoaderError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let color = decoder.color_type();
    if !matches!(color, ColorType::Rgb8 | ColorType::L8) {
        return Err(ImageLoaderError::ChannelCount {
            path: path.to_path_buf(),
            color,
        });
    }

    Ok(decoder)
}

/// Load a JPEG, resize it to `size` and scale every value to `[0, 1]`.
///
/// Grayscale images are expanded to three identical channels. Resizing uses
/// bilinear interpolation and is deterministic.
pub fn load_image<P: AsRef<Path>>(
    path: P,
    size: ImageSize,
) -> Result<ImageTensor, ImageLoaderError> {
    let path = path.as_ref();
    size.validate()?;

    let decoder = open_jpeg(path)?;
    let image =
        DynamicImage::from_decoder(decoder).map_err(|source| ImageLoaderError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let resized = imageops::resize(
        &image.into_rgb8(),
        size.width,
        size.height,
        FilterType::Triangle,
    );

    let pixels = resized
        .into_raw()
        .into_iter()
        .map(|value| value as f32 / 255.0)
        .collect();

    Ok(ImageTensor {
        pixels,
        height: size.height as usize,
        width: size.width as usize,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use rstest::rstest;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// Write a colored JPEG with a gradient so resizing has something to interpolate.
    pub(crate) fn write_jpeg(path: &Path, width: u32, height: u32) {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        image.save(path).unwrap();
    }

    /// Write a single-channel JPEG, the usual encoding of radiographs.
    pub(crate) fn write_gray_jpeg(path: &Path, width: u32, height: u32) {
        let image = GrayImage::from_fn(width, height, |x, y| {
            Luma([((x * 3 + y * 5) % 256) as u8])
        });
        image.save(path).unwrap();
    }

    #[rstest]
    #[case(40, 30)]
    #[case(224, 224)]
    #[case(8, 500)]
    fn loaded_image_is_resized_and_normalized(#[case] width: u32, #[case] height: u32) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.jpg");
        write_jpeg(&path, width, height);

        let image = load_image(&path, ImageSize::new(32, 24)).unwrap();

        assert_eq!(image.shape(), [24, 32, 3]);
        assert_eq!(image.pixels().len(), 24 * 32 * 3);
        assert!(image.pixels().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn loading_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.jpg");
        write_jpeg(&path, 64, 48);
        let size = ImageSize::new(20, 20);

        let first = load_image(&path, size).unwrap();
        let second = load_image(&path, size).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn tensor_data_keeps_height_width_channels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.jpg");
        write_jpeg(&path, 16, 16);

        let data = load_image(&path, ImageSize::new(10, 12)).unwrap().into_data();
        let tensor = Tensor::<TestBackend, 3>::from_data(data, &Default::default());

        assert_eq!(tensor.dims(), [12, 10, 3]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let result = load_image(dir.path().join("missing.jpg"), ImageSize::new(8, 8));

        assert!(matches!(result, Err(ImageLoaderError::Io { .. })));
    }

    #[test]
    fn png_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.png");
        RgbImage::new(8, 8).save(&path).unwrap();

        let result = load_image(&path, ImageSize::new(8, 8));

        assert!(matches!(result, Err(ImageLoaderError::Decode { .. })));
    }

    #[test]
    fn arbitrary_bytes_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(matches!(
            load_image(&path, ImageSize::new(8, 8)),
            Err(ImageLoaderError::Decode { .. })
        ));
    }

    #[test]
    fn grayscale_jpeg_is_expanded_to_rgb() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xray.jpg");
        write_gray_jpeg(&path, 40, 30);

        let image = load_image(&path, ImageSize::new(16, 12)).unwrap();

        assert_eq!(image.shape(), [12, 16, 3]);
        assert!(image
            .pixels()
            .chunks_exact(CHANNELS)
            .all(|rgb| rgb[0] == rgb[1] && rgb[1] == rgb[2]));
        assert!(image.pixels().iter().any(|v| *v > 0.0));
    }

    #[test]
    fn zero_target_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.jpg");
        write_jpeg(&path, 8, 8);

        let result = load_image(&path, ImageSize::new(0, 8));

        assert!(matches!(
            result,
            Err(ImageLoaderError::InvalidTargetSize { .. })
        ));
    }
}
