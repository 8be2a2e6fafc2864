//! Image-folder datasets
//!
//! A split directory holds one subdirectory per class:
//!
//! ```text
//! data/
//! ├── train/
//! │   ├── cats/
//! │   │   ├── cat.0.jpg
//! │   │   └── ...
//! │   └── dogs/
//! │       └── ...
//! └── valid/
//!     └── ...
//! ```
//!
//! Class labels are indices into the sorted list of class directory names.
//! Images are decoded lazily on indexed access and turned into normalized CHW
//! float vectors by an [`ImageTransform`].

use std::fs;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use image::{ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DataConfig;
use crate::dataset::loader::TryDataset;
use crate::utils::error::{Result, TransferError};

/// File extensions accepted as images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Center crop, conversion to `[0, 1]` CHW floats and per-channel normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTransform {
    pub crop_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ImageTransform {
    /// The VGG preprocessing: 224 center crop with ImageNet statistics
    pub fn vgg() -> Self {
        Self::with_crop(224)
    }

    pub fn with_crop(crop_size: u32) -> Self {
        Self {
            crop_size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Length of the vector produced for one image
    pub fn output_len(&self) -> usize {
        3 * self.crop_size as usize * self.crop_size as usize
    }

    /// Crop, scale and normalize an RGB image into a CHW vector
    ///
    /// Images smaller than the crop along an axis are padded with black on
    /// both sides before normalization.
    pub fn apply(&self, img: &RgbImage) -> Vec<f32> {
        let size = self.crop_size as usize;
        let (width, height) = img.dimensions();
        let offset_x = crop_offset(width, self.crop_size);
        let offset_y = crop_offset(height, self.crop_size);

        let plane = size * size;
        let mut out = vec![0.0f32; 3 * plane];

        for oy in 0..size {
            let sy = oy as i64 + offset_y;
            if sy < 0 || sy >= height as i64 {
                continue;
            }
            for ox in 0..size {
                let sx = ox as i64 + offset_x;
                if sx < 0 || sx >= width as i64 {
                    continue;
                }
                let pixel = img.get_pixel(sx as u32, sy as u32);
                for c in 0..3 {
                    out[c * plane + oy * size + ox] = pixel[c] as f32 / 255.0;
                }
            }
        }

        for (c, channel) in out.chunks_mut(plane).enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            for v in channel {
                *v = (*v - mean) / std;
            }
        }

        out
    }

    /// Decode the file at `path` and transform it
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = ImageReader::open(path)
            .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .with_guessed_format()
            .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))?
            .decode()
            .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))?;

        Ok(self.apply(&img.to_rgb8()))
    }
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::vgg()
    }
}

/// Source coordinate of the first output pixel along one axis
///
/// Negative when the image is padded.
fn crop_offset(len: u32, crop: u32) -> i64 {
    if len >= crop {
        ((len - crop) as f64 / 2.0).round_ties_even() as i64
    } else {
        -(((crop - len) / 2) as i64)
    }
}

/// One decoded sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    /// Normalized image as flattened CHW floats
    pub image: Vec<f32>,
    pub label: usize,
}

/// Lazily decoded dataset over an image-folder split
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
    transform: ImageTransform,
}

impl ImageFolderDataset {
    /// Scan `root` for class directories and their images
    pub fn new<P: AsRef<Path>>(root: P, transform: ImageTransform) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let classes = find_classes(&root)?;
        if classes.is_empty() {
            return Err(TransferError::EmptyDataset(root));
        }

        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();

        for (label, class_name) in classes.iter().enumerate() {
            let files = collect_images(&root.join(class_name));
            debug!("Class '{}' (label {}): {} images", class_name, label, files.len());

            if files.is_empty() {
                empty_classes.push(class_name.clone());
            }
            samples.extend(files.into_iter().map(|path| (path, label)));
        }

        if samples.is_empty() {
            return Err(TransferError::EmptyDataset(root));
        }
        if !empty_classes.is_empty() {
            return Err(TransferError::Dataset(format!(
                "no valid image files for classes {:?} under {:?}",
                empty_classes, root
            )));
        }

        info!(
            "Loaded {} samples in {} classes from {:?}",
            samples.len(),
            classes.len(),
            root
        );

        Ok(Self {
            root,
            classes,
            samples,
            transform,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Class names, indexed by label
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// `(path, label)` pairs in dataset order
    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    pub fn transform(&self) -> &ImageTransform {
        &self.transform
    }

    /// Number of samples per label
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.classes.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// Decode and transform the sample at `index`
    pub fn load(&self, index: usize) -> Result<ImageItem> {
        let (path, label) = self.samples.get(index).ok_or_else(|| {
            TransferError::Dataset(format!(
                "index {} out of range for {} samples",
                index,
                self.samples.len()
            ))
        })?;

        Ok(ImageItem {
            image: self.transform.load(path)?,
            label: *label,
        })
    }
}

impl TryDataset<ImageItem> for ImageFolderDataset {
    fn try_get(&self, index: usize) -> Result<ImageItem> {
        self.load(index)
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        match self.load(index) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Sorted names of the subdirectories of `dir`
pub fn find_classes(dir: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                classes.push(name.to_string());
            }
        }
    }
    classes.sort();
    Ok(classes)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Image files anywhere below `class_dir`
///
/// Grouped by containing directory, directories in byte order of their path,
/// so a directory's own files come before those of its subdirectories.
fn collect_images(class_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(class_dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| has_image_extension(p))
        .collect();
    files.sort_by(|a, b| {
        fn key(p: &Path) -> (Option<&std::ffi::OsStr>, Option<&std::ffi::OsStr>) {
            (p.parent().map(Path::as_os_str), p.file_name())
        }
        key(a).cmp(&key(b))
    });
    files
}

/// The train and valid datasets of one data directory
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageFolderDataset,
    pub valid: ImageFolderDataset,
}

impl DatasetSplits {
    /// Class names of the training split
    pub fn classes(&self) -> &[String] {
        self.train.classes()
    }
}

/// Build both splits of `data` with the same transform
pub fn prepare_datasets(data: &DataConfig, transform: ImageTransform) -> Result<DatasetSplits> {
    let train = ImageFolderDataset::new(data.train_dir(), transform.clone())?;
    let valid = ImageFolderDataset::new(data.valid_dir(), transform)?;

    if train.classes() != valid.classes() {
        warn!(
            "Class directories differ between splits: train {:?}, valid {:?}",
            train.classes(),
            valid.classes()
        );
    }

    Ok(DatasetSplits { train, valid })
}
