//! Writing the learned item embeddings to disk.
//!
//! Every output table has one row per exported item, in item index order,
//! so row `i` of `items.tsv`, `factors.tsv` and `factors-3d.tsv` always
//! describe the same entity.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use failure::Fail;
use itertools::izip;
use ndarray::{Array2, ArrayView1, Axis};
use serde::Serialize;
use tracing::info;

use crate::index::EntityIndex;
use crate::models::FactorizationModel;
use crate::projection::{ProjectionError, Projector};
use crate::search::TrialRecord;
use crate::ItemId;

/// Name of the item table.
pub const ITEMS_FILE: &str = "items.tsv";
/// Name of the full factor table.
pub const FACTORS_FILE: &str = "factors.tsv";
/// Name of the projected factor table.
pub const PROJECTED_FACTORS_FILE: &str = "factors-3d.tsv";
/// Name of the search log.
pub const SEARCH_RESULTS_FILE: &str = "search-results.json";

/// Export error types.
#[derive(Debug, Fail)]
pub enum ExportError {
    /// An output file could not be created or written.
    #[fail(display = "Unable to write {:?}: {}", path, cause)]
    Io {
        /// The file being written.
        path: PathBuf,
        /// The underlying error.
        #[cause]
        cause: std::io::Error,
    },
    /// A TSV row could not be written.
    #[fail(display = "Unable to write TSV row: {}", _0)]
    Csv(#[cause] csv::Error),
    /// The search log could not be serialized.
    #[fail(display = "Unable to write search results: {}", _0)]
    Json(#[cause] serde_json::Error),
    /// The projection failed.
    #[fail(display = "Projection failed: {}", _0)]
    Projection(#[cause] ProjectionError),
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        ExportError::Csv(err)
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Json(err)
    }
}

impl From<ProjectionError> for ExportError {
    fn from(err: ProjectionError) -> Self {
        ExportError::Projection(err)
    }
}

/// Which items to export.
#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    require_labels: bool,
}

impl ExportOptions {
    /// Only export items with a non-blank label.
    pub fn require_labels(mut self, require: bool) -> Self {
        self.require_labels = require;
        self
    }

    /// Whether labels are required.
    pub fn requires_labels(&self) -> bool {
        self.require_labels
    }
}

/// One exported item.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExportRow {
    /// Label, empty when unknown.
    pub label: String,
    /// The item key.
    pub address: String,
    /// Item index in the model.
    #[serde(skip)]
    pub item_id: ItemId,
}

/// Counters describing an export.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExportSummary {
    /// Rows written to every table.
    pub written: usize,
    /// Items at or beyond the real-item boundary.
    pub synthetic: usize,
    /// Real items dropped for lacking a label.
    pub unlabelled: usize,
    /// Real items with an empty key.
    pub empty_key: usize,
}

/// Select the rows to export, in item index order.
///
/// Items at or above `real_items` are synthetic and never exported. Labels
/// are trimmed, and a blank label counts as missing. Tabs and line breaks in
/// labels and keys become spaces so every row stays one TSV line.
pub fn select_rows(
    items: &EntityIndex<String>,
    real_items: usize,
    labels: &HashMap<String, String>,
    options: &ExportOptions,
) -> (Vec<ExportRow>, ExportSummary) {
    let mut summary = ExportSummary::default();
    let mut rows = Vec::new();

    for (item_id, key) in items.iter() {
        if item_id >= real_items {
            summary.synthetic += 1;
            continue;
        }

        if key.is_empty() {
            summary.empty_key += 1;
            continue;
        }

        let label = labels
            .get(key)
            .map(|label| label.trim())
            .filter(|label| !label.is_empty());

        if label.is_none() && options.require_labels {
            summary.unlabelled += 1;
            continue;
        }

        rows.push(ExportRow {
            label: tsv_field(label.unwrap_or("")),
            address: tsv_field(key),
            item_id,
        });
    }

    summary.written = rows.len();

    (rows, summary)
}

fn tsv_field(value: &str) -> String {
    value.replace(|c: char| matches!(c, '\t' | '\r' | '\n'), " ")
}

fn create(path: &Path) -> Result<BufWriter<File>, ExportError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|cause| ExportError::Io {
            path: path.to_owned(),
            cause,
        })
}

fn tsv_writer(path: &Path, has_headers: bool) -> Result<csv::Writer<BufWriter<File>>, ExportError> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .has_headers(has_headers)
        .from_writer(create(path)?))
}

fn factor_record(row: ArrayView1<f32>) -> Vec<String> {
    row.iter().map(|x| x.to_string()).collect()
}

/// Write the item, factor and (optionally) projected factor tables of
/// `model` into `directory`.
pub fn write_exports(
    directory: &Path,
    model: &FactorizationModel,
    items: &EntityIndex<String>,
    real_items: usize,
    labels: &HashMap<String, String>,
    options: &ExportOptions,
    projector: Option<&dyn Projector>,
) -> Result<ExportSummary, ExportError> {
    let (rows, summary) = select_rows(items, real_items, labels, options);

    let item_ids: Vec<ItemId> = rows.iter().map(|row| row.item_id).collect();
    let factors = model.item_factors().select(Axis(0), &item_ids);

    let projected: Option<Array2<f32>> = match projector {
        Some(projector) => {
            info!(rows = rows.len(), "Projecting item factors");
            Some(projector.project(&factors)?)
        }
        None => None,
    };

    let mut items_writer = tsv_writer(&directory.join(ITEMS_FILE), true)?;
    let mut factors_writer = tsv_writer(&directory.join(FACTORS_FILE), false)?;

    for (row, item_factors) in izip!(&rows, factors.outer_iter()) {
        items_writer.serialize(row)?;
        factors_writer.write_record(factor_record(item_factors))?;
    }

    if rows.is_empty() {
        items_writer.write_record(["label", "address"])?;
    }

    items_writer.flush().map_err(|cause| ExportError::Io {
        path: directory.join(ITEMS_FILE),
        cause,
    })?;
    factors_writer.flush().map_err(|cause| ExportError::Io {
        path: directory.join(FACTORS_FILE),
        cause,
    })?;

    if let Some(projected) = projected {
        let path = directory.join(PROJECTED_FACTORS_FILE);
        let mut writer = tsv_writer(&path, false)?;
        for row in projected.outer_iter() {
            writer.write_record(factor_record(row))?;
        }
        writer
            .flush()
            .map_err(|cause| ExportError::Io { path, cause })?;
    }

    info!(
        written = summary.written,
        synthetic = summary.synthetic,
        unlabelled = summary.unlabelled,
        empty_key = summary.empty_key,
        "Exported item factors"
    );

    Ok(summary)
}

/// Write the trial log as a pretty-printed JSON array.
pub fn write_search_results(path: &Path, trials: &[TrialRecord]) -> Result<(), ExportError> {
    let mut writer = create(path)?;
    serde_json::to_writer_pretty(&mut writer, trials)?;
    writer.flush().map_err(|cause| ExportError::Io {
        path: path.to_owned(),
        cause,
    })
}
