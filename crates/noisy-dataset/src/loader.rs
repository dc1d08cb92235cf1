//! Image and manifest loading.
//!
//! Two on-disk layouts are understood: a CSV manifest (one row per image) and
//! a folder tree with one subdirectory per class.

use image::DynamicImage;
use noisy_core::{DataSplit, Error, Result};
use std::path::{Path, PathBuf};

const IMAGE_COLUMN: &str = "image";
const LABEL_COLUMN: &str = "label";
const SPLIT_COLUMN: &str = "split";
const TRUE_LABEL_COLUMN: &str = "true_label";
const ANNOTATIONS_COLUMN: &str = "annotations";

/// One labelled image reference read from disk
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Label as given by the source
    pub label: usize,
    /// Clean label, when the source ships one next to a noisy `label`
    pub true_label: Option<usize>,
    /// Per-class annotator counts
    pub annotations: Option<Vec<f32>>,
}

/// Image loader rooted at a data directory
#[derive(Debug, Clone)]
pub struct ImageLoader {
    root_dir: PathBuf,
}

impl ImageLoader {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Gets the full path for an image
    pub fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    pub fn load_image(&self, path: &Path) -> Result<DynamicImage> {
        let full_path = self.full_path(path);
        if !full_path.exists() {
            return Err(Error::NotFound(format!(
                "Image file not found: {}",
                full_path.display()
            )));
        }

        image::open(&full_path)
            .map_err(|e| Error::Image(format!("Failed to load image {}: {}", full_path.display(), e)))
    }

    /// Image files directly inside `dir`, sorted for a stable sample order
    pub fn scan_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full_dir = self.full_path(dir);
        if !full_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Directory not found: {}",
                full_dir.display()
            )));
        }

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&full_dir)? {
            let path = entry?.path();
            if path.is_file() && is_image_file(&path) {
                images.push(path);
            }
        }
        images.sort();
        Ok(images)
    }

    /// Reads a folder tree where each subdirectory is one class.
    ///
    /// Returns the class names (sorted) and one entry per image.
    pub fn scan_class_folders(&self) -> Result<(Vec<String>, Vec<ManifestEntry>)> {
        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(Error::Dataset(format!(
                "No class directories under {}",
                self.root_dir.display()
            )));
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut entries = Vec::new();
        for (label, dir) in class_dirs.iter().enumerate() {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            class_names.push(name);

            for path in self.scan_directory(dir)? {
                entries.push(ManifestEntry {
                    path,
                    label,
                    true_label: None,
                    annotations: None,
                });
            }
        }

        Ok((class_names, entries))
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            matches!(
                ext.to_string_lossy().to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "bmp" | "gif"
            )
        })
        .unwrap_or(false)
}

/// Reads a CSV manifest, optionally keeping only rows of one split.
///
/// `image` and `label` columns are required. Asking for a split when the
/// manifest has no `split` column is an error rather than a silent no-op.
pub fn read_manifest(path: &Path, split: Option<DataSplit>) -> Result<Vec<ManifestEntry>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);

    let missing: Vec<&str> = [IMAGE_COLUMN, LABEL_COLUMN]
        .into_iter()
        .filter(|name| column(name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Dataset(format!(
            "Manifest {} is missing required columns: {}",
            path.display(),
            missing.join(", ")
        )));
    }

    let image_idx = column(IMAGE_COLUMN).unwrap_or_default();
    let label_idx = column(LABEL_COLUMN).unwrap_or_default();
    let split_idx = column(SPLIT_COLUMN);
    let true_label_idx = column(TRUE_LABEL_COLUMN);
    let annotations_idx = column(ANNOTATIONS_COLUMN);

    if split.is_some() && split_idx.is_none() {
        return Err(Error::Dataset(format!(
            "Manifest {} has no '{}' column, cannot select split",
            path.display(),
            SPLIT_COLUMN
        )));
    }

    let mut entries = Vec::new();
    for (row_number, record) in reader.records().enumerate() {
        let record = record?;
        let field = |idx: usize| record.get(idx).map(str::trim).unwrap_or("");

        if let (Some(wanted), Some(idx)) = (split, split_idx) {
            if !split_matches(field(idx), wanted) {
                continue;
            }
        }

        let label = parse_label(field(label_idx), row_number, LABEL_COLUMN)?;
        let true_label = match true_label_idx.map(field) {
            Some(value) if !value.is_empty() => {
                Some(parse_label(value, row_number, TRUE_LABEL_COLUMN)?)
            }
            _ => None,
        };
        let annotations = match annotations_idx.map(field) {
            Some(value) if !value.is_empty() => Some(parse_annotations(value, row_number)?),
            _ => None,
        };

        entries.push(ManifestEntry {
            path: PathBuf::from(field(image_idx)),
            label,
            true_label,
            annotations,
        });
    }

    Ok(entries)
}

fn split_matches(value: &str, wanted: DataSplit) -> bool {
    let value = value.to_ascii_lowercase();
    match wanted {
        DataSplit::Validation => value == "val" || value == "validation",
        _ => value == wanted.as_str(),
    }
}

fn parse_label(value: &str, row: usize, column: &str) -> Result<usize> {
    value.parse().map_err(|_| {
        Error::Dataset(format!("Row {}: invalid {} '{}'", row + 1, column, value))
    })
}

fn parse_annotations(value: &str, row: usize) -> Result<Vec<f32>> {
    value
        .split(';')
        .map(|count| {
            count.trim().parse::<f32>().map_err(|_| {
                Error::Dataset(format!("Row {}: invalid annotation count '{}'", row + 1, count))
            })
        })
        .collect()
}
