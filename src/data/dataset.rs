use burn::data::dataset::Dataset;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use super::transform::ImageTransform;
use crate::error::{Error, Result};

/// Ground truth attached to one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    /// Class index, e.g. the binary style label.
    Class(usize),
    /// Probability vector over classes, e.g. normalized score votes.
    Distribution(Vec<f32>),
}

impl Label {
    /// Number of values one label contributes to a collated batch.
    pub fn width(&self) -> usize {
        match self {
            Label::Class(_) => 1,
            Label::Distribution(probs) => probs.len(),
        }
    }
}

/// One decoded, transformed image with its label.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Position of the sample in its dataset.
    pub index: usize,
    /// Channel-major pixel values, `shape[0] * shape[1] * shape[2]` long.
    pub image: Vec<f32>,
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    pub label: Label,
}

#[derive(Debug, Clone)]
struct Record {
    image_path: PathBuf,
    label: Label,
}

/// CSV-described image dataset resolved against an image root directory.
///
/// The descriptor has a header line followed by `image_id,label...` rows.
/// A single label column is a class index; several columns are score
/// counts normalized into a distribution.
pub struct ImageCsvDataset {
    records: Vec<Record>,
    transform: ImageTransform,
}

impl ImageCsvDataset {
    pub fn from_csv(csv_path: &Path, root_dir: &Path, transform: ImageTransform) -> Result<Self> {
        let file = File::open(csv_path)
            .map_err(|e| Error::data(csv_path, format!("cannot read descriptor: {}", e)))?;

        let records = parse_records(csv_path, file, root_dir)?;
        info!(
            "Loaded {} samples from {:?} (images under {:?})",
            records.len(),
            csv_path,
            root_dir
        );

        Ok(Self { records, transform })
    }

    /// Decodes and transforms sample `index`.
    pub fn load(&self, index: usize) -> Result<Sample> {
        let record = self.records.get(index).ok_or_else(|| {
            Error::data(
                PathBuf::new(),
                format!("index {} out of range ({} samples)", index, self.records.len()),
            )
        })?;

        let img = image::open(&record.image_path)
            .map_err(|e| Error::data(&record.image_path, e.to_string()))?;
        let (image, shape) = self.transform.apply(&img);

        Ok(Sample {
            index,
            image,
            shape,
            label: record.label.clone(),
        })
    }
}

impl Dataset<Sample> for ImageCsvDataset {
    /// `None` for an out-of-range index or an image that fails to load; the
    /// failure is logged with its cause.
    fn get(&self, index: usize) -> Option<Sample> {
        self.load(index)
            .map_err(|e| error!("Cannot load sample {}: {}", index, e))
            .ok()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

fn parse_records<R: Read>(csv_path: &Path, input: R, root_dir: &Path) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let columns = reader
        .headers()
        .map_err(|e| Error::data(csv_path, e.to_string()))?
        .len();
    if columns < 2 {
        return Err(Error::data(
            csv_path,
            format!("expected an image id and at least one label column, found {} columns", columns),
        ));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| Error::data(csv_path, e.to_string()))?;
        let line = row.position().map_or(0, |p| p.line());

        let labels: Vec<&str> = row.iter().skip(1).collect();
        let label = parse_label(&labels)
            .map_err(|reason| Error::data(csv_path, format!("line {}: {}", line, reason)))?;

        records.push(Record {
            image_path: resolve_image(root_dir, &row[0]),
            label,
        });
    }

    if records.is_empty() {
        return Err(Error::data(csv_path, "descriptor has no samples"));
    }

    Ok(records)
}

fn parse_label(fields: &[&str]) -> std::result::Result<Label, String> {
    if let [single] = fields {
        let class = single
            .parse::<f64>()
            .map_err(|_| format!("label {:?} is not a number", single))?;
        if class < 0.0 || class.fract() != 0.0 {
            return Err(format!("label {:?} is not a class index", single));
        }
        return Ok(Label::Class(class as usize));
    }

    let mut scores = Vec::with_capacity(fields.len());
    for field in fields {
        let value = field
            .parse::<f32>()
            .map_err(|_| format!("score {:?} is not a number", field))?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("score {:?} must be finite and non-negative", field));
        }
        scores.push(value);
    }

    let total: f32 = scores.iter().sum();
    if total <= 0.0 {
        return Err("score columns sum to zero".to_string());
    }

    Ok(Label::Distribution(scores.into_iter().map(|s| s / total).collect()))
}

fn resolve_image(root_dir: &Path, image_id: &str) -> PathBuf {
    if Path::new(image_id).extension().is_some() {
        root_dir.join(image_id)
    } else {
        root_dir.join(format!("{}.jpg", image_id))
    }
}
