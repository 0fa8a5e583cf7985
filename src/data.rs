use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage, ImageReader};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};

const CHANNEL_COUNT: usize = 3;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub label: usize,
}

/// A decoded, centre-cropped image in CHW order.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub pixels: Vec<u8>,
    pub label: usize,
}

/// Images laid out as `root/<class>/<file>`, classes labelled in sorted order.
pub struct ImageFolder {
    entries: Vec<ImageEntry>,
    classes: Vec<String>,
    image_size: usize,
}

impl ImageFolder {
    pub fn index(root: &Path, image_size: usize) -> Result<Self> {
        ensure!(image_size > 0, "image size must be positive");

        let mut classes = fs::read_dir(root)
            .with_context(|| format!("failed to read dataset directory {}", root.display()))?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        classes.sort();
        ensure!(!classes.is_empty(), "no class directories in {}", root.display());

        let per_class = classes
            .par_iter()
            .enumerate()
            .map(|(label, class)| {
                let dir = root.join(class);
                let mut paths = fs::read_dir(&dir)
                    .with_context(|| format!("failed to read class directory {}", dir.display()))?
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file())
                    .filter(|path| match image::image_dimensions(path) {
                        Ok(_) => true,
                        Err(err) => {
                            tracing::warn!("skipping {}: {err}", path.display());
                            false
                        }
                    })
                    .collect::<Vec<_>>();
                paths.sort();

                Ok::<_, anyhow::Error>(
                    paths
                        .into_iter()
                        .map(|path| ImageEntry { path, label })
                        .collect::<Vec<_>>(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ImageFolder {
            entries: per_class.into_iter().flatten().collect(),
            classes,
            image_size,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    fn load(&self, entry: &ImageEntry) -> Result<ImageItem> {
        let image = ImageReader::open(&entry.path)?.with_guessed_format()?.decode()?;

        Ok(ImageItem {
            pixels: preprocess(&image, self.image_size),
            label: entry.label,
        })
    }
}

impl Dataset<ImageItem> for ImageFolder {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let entry = self.entries.get(index)?;

        match self.load(entry) {
            Ok(item) => Some(item),
            Err(err) => {
                // keep the epoch length stable, the sample just scores as a miss
                tracing::error!("failed to decode {}: {err:#}", entry.path.display());
                Some(ImageItem {
                    pixels: vec![0; CHANNEL_COUNT * self.image_size * self.image_size],
                    label: entry.label,
                })
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Resizes the shorter side to `size * 256 / 224`, then crops the centre `size` square.
pub fn preprocess(image: &DynamicImage, size: usize) -> Vec<u8> {
    let resize_to = (size * 256 / 224) as f64;
    let (width, height) = (image.width() as f64, image.height() as f64);
    let scale = resize_to / width.min(height);

    let new_width = ((width * scale).round() as u32).max(size as u32);
    let new_height = ((height * scale).round() as u32).max(size as u32);
    let resized = image.resize_exact(new_width, new_height, FilterType::Triangle);

    let left = (new_width - size as u32) / 2;
    let top = (new_height - size as u32) / 2;
    let cropped = resized.crop_imm(left, top, size as u32, size as u32).to_rgb8();

    let mut pixels = vec![0; CHANNEL_COUNT * size * size];
    for (i, pixel) in cropped.pixels().enumerate() {
        for (c, value) in pixel.0.into_iter().enumerate() {
            pixels[c * size * size + i] = value;
        }
    }

    pixels
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
}

#[derive(Clone)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let plane = self.image_size * self.image_size;

        let values = items
            .iter()
            .flat_map(|item| {
                item.pixels
                    .iter()
                    .enumerate()
                    .map(move |(i, &value)| {
                        let c = i / plane;
                        (value as f32 / 255. - MEAN[c]) / STD[c]
                    })
            })
            .collect::<Vec<f32>>();
        let labels = items.iter().map(|item| item.label).collect::<Vec<_>>();

        let shape = [items.len(), CHANNEL_COUNT, self.image_size, self.image_size];
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(values, shape).convert::<B::FloatElem>(),
            &self.device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(
                labels.iter().map(|&label| label as i64).collect::<Vec<_>>(),
                [labels.len()],
            )
            .convert::<B::IntElem>(),
            &self.device,
        );

        ImageBatch {
            images,
            targets,
            labels,
        }
    }
}
