//! # Similarity Queries
//!
//! Answers "what did applicants like this one pay?" by ranking historical
//! reference rows on squared Euclidean distance in the normalized reduced
//! feature space and histogramming the target over the closest ones.
//!
//! The normalized reference matrix is computed once when the index is built and
//! never changes afterwards; every query is a pure read.
//!
//! Ranking uses minimum-rank semantics: rows at equal distance share the lowest
//! rank of their group, and every row whose rank is at most `k` is selected. A
//! tie straddling the cut-off therefore yields more than `k` rows.

use crate::fit::normalize::{NormalizationError, NormalizationParameters};
use crate::prepare::table::{ApplicantTable, TableError};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BIN_WIDTH: f64 = 0.5;
/// Upper bound on histogram length; a wider domain needs a coarser bin width.
pub const MAX_HISTOGRAM_BINS: usize = 10_000;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("The reference set has no complete rows.")]
    Empty,
    #[error("Query has {found} values but the index uses {expected} features.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Query value for '{0}' is missing or not a finite number.")]
    MissingValue(String),
    #[error("Neighbourhood size must be at least 1.")]
    InvalidK,
    #[error("Histogram bin width must be a positive number, got {0}.")]
    InvalidBinWidth(f64),
    #[error(
        "A histogram over [{lower}, {upper}] with bin width {bin_width} needs more than {max} bins."
    )]
    TooManyBins {
        lower: f64,
        upper: f64,
        bin_width: f64,
        max: usize,
    },
    #[error("Reference row {row} holds a non-finite value in '{column}'.")]
    NonFiniteReference { row: usize, column: String },
    #[error("Reference file is malformed: {0}")]
    MalformedReference(String),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("Failed to read or write reference rows: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fixed-width frequency counts over `[start, start + bin_width * counts.len())`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub start: f64,
    pub bin_width: f64,
    pub counts: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

impl Histogram {
    /// Bins `values` over `domain`, with edges at multiples of `bin_width`.
    ///
    /// The bins cover the whole domain even where they are empty, so histograms
    /// from different queries against one index line up bin for bin.
    pub fn from_values(
        values: impl IntoIterator<Item = f64>,
        domain: (f64, f64),
        bin_width: f64,
    ) -> Result<Self, SimilarityError> {
        if !(bin_width.is_finite() && bin_width > 0.0) {
            return Err(SimilarityError::InvalidBinWidth(bin_width));
        }
        let first = (domain.0 / bin_width).floor();
        let last = (domain.1 / bin_width).floor().max(first);
        let span = last - first;
        if !span.is_finite() || span >= MAX_HISTOGRAM_BINS as f64 {
            return Err(SimilarityError::TooManyBins {
                lower: domain.0,
                upper: domain.1,
                bin_width,
                max: MAX_HISTOGRAM_BINS,
            });
        }
        let bins = span as usize + 1;
        let mut counts = vec![0; bins];
        for value in values.into_iter().filter(|v| v.is_finite()) {
            let slot = ((value / bin_width).floor() - first).clamp(0.0, (bins - 1) as f64);
            counts[slot as usize] += 1;
        }
        Ok(Self {
            start: first * bin_width,
            bin_width,
            counts,
        })
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn bins(&self) -> impl Iterator<Item = Bin> + '_ {
        self.counts.iter().enumerate().map(move |(i, &count)| {
            let lower = self.start + i as f64 * self.bin_width;
            Bin {
                lower,
                upper: lower + self.bin_width,
                count,
            }
        })
    }

    /// Writes `lower  upper  count` rows as TSV.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), SimilarityError> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        out.write_record(["lower", "upper", "count"])?;
        for bin in self.bins() {
            out.write_record([
                format!("{:.2}", bin.lower),
                format!("{:.2}", bin.upper),
                bin.count.to_string(),
            ])?;
        }
        out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbour {
    /// Position in the reference set.
    pub row: usize,
    pub distance: f64,
    pub rank: usize,
    pub target: f64,
}

/// The selected reference rows, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbourhood {
    pub k: usize,
    pub members: Vec<Neighbour>,
}

impl Neighbourhood {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = f64> + '_ {
        self.members.iter().map(|m| m.target)
    }
}

/// Historical reference rows with their normalization frozen at build time.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    target: String,
    features: Vec<String>,
    normalization: NormalizationParameters,
    raw: Array2<f64>,
    normalized: Array2<f64>,
    targets: Array1<f64>,
    domain: (f64, f64),
}

impl SimilarityIndex {
    /// Indexes every row of `table` that has all of `features`.
    pub fn build(table: &ApplicantTable, features: &[String]) -> Result<Self, SimilarityError> {
        let complete = table.complete_rows(features)?;
        let excluded = table.len() - complete.len();
        if excluded > 0 {
            log::info!(
                "Similarity index: excluded {} of {} reference rows with missing features.",
                excluded,
                table.len()
            );
        }
        let (x, y) = table.select_rows(&complete).design_matrix(features)?;
        Self::from_rows(table.target_name(), features, x, y)
    }

    pub fn from_rows(
        target: &str,
        features: &[String],
        raw: Array2<f64>,
        targets: Array1<f64>,
    ) -> Result<Self, SimilarityError> {
        if raw.nrows() == 0 {
            return Err(SimilarityError::Empty);
        }
        if raw.ncols() != features.len() {
            return Err(SimilarityError::DimensionMismatch {
                expected: features.len(),
                found: raw.ncols(),
            });
        }
        if targets.len() != raw.nrows() {
            return Err(SimilarityError::MalformedReference(format!(
                "{} feature rows but {} targets",
                raw.nrows(),
                targets.len()
            )));
        }
        if let Some(row) = targets.iter().position(|t| !t.is_finite()) {
            return Err(SimilarityError::NonFiniteReference {
                row,
                column: target.to_string(),
            });
        }
        if let Some(((row, column), _)) = raw.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(SimilarityError::NonFiniteReference {
                row,
                column: features[column].clone(),
            });
        }
        let normalization = NormalizationParameters::fit(features, raw.view())?;
        let normalized = normalization.transform(raw.view())?;
        let domain = targets
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
                (lo.min(t), hi.max(t))
            });
        log::debug!(
            "Similarity index over {} rows; '{}' spans [{}, {}].",
            raw.nrows(),
            target,
            domain.0,
            domain.1
        );
        Ok(Self {
            target: target.to_string(),
            features: features.to_vec(),
            normalization,
            raw,
            normalized,
            targets,
            domain,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Observed `(min, max)` of the target over the reference rows.
    pub fn domain(&self) -> (f64, f64) {
        self.domain
    }

    /// Reference rows nearest to `point` (raw values in feature order).
    pub fn query(&self, point: &[f64], k: usize) -> Result<Neighbourhood, SimilarityError> {
        if k == 0 {
            return Err(SimilarityError::InvalidK);
        }
        if point.len() != self.features.len() {
            return Err(SimilarityError::DimensionMismatch {
                expected: self.features.len(),
                found: point.len(),
            });
        }
        if let Some(slot) = point.iter().position(|v| !v.is_finite()) {
            return Err(SimilarityError::MissingValue(self.features[slot].clone()));
        }
        let q = self.normalization.transform_row(ArrayView1::from(point))?;

        let distances: Vec<f64> = self
            .normalized
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                row.iter()
                    .zip(q.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
            })
            .collect();

        let mut order: Vec<usize> = (0..distances.len()).collect();
        order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

        let mut members = Vec::new();
        let mut rank = 0;
        for (position, &row) in order.iter().enumerate() {
            let tied = position > 0 && distances[row] == distances[order[position - 1]];
            if !tied {
                rank = position + 1;
            }
            if rank > k {
                break;
            }
            members.push(Neighbour {
                row,
                distance: distances[row],
                rank,
                target: self.targets[row],
            });
        }
        Ok(Neighbourhood { k, members })
    }

    /// Histogram of the target over the neighbourhood of `point`.
    pub fn compare(
        &self,
        point: &[f64],
        k: usize,
        bin_width: f64,
    ) -> Result<Histogram, SimilarityError> {
        let neighbourhood = self.query(point, k)?;
        Histogram::from_values(neighbourhood.targets(), self.domain, bin_width)
    }

    /// Persists the raw reference rows as TSV: one column per feature, then the target.
    pub fn write_reference(&self, path: &Path) -> Result<(), SimilarityError> {
        let mut out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        out.write_record(self.features.iter().chain(std::iter::once(&self.target)))?;
        for (row, &target) in self.raw.axis_iter(Axis(0)).zip(self.targets.iter()) {
            out.write_record(
                row.iter()
                    .chain(std::iter::once(&target))
                    .map(|v| v.to_string()),
            )?;
        }
        out.flush()?;
        log::info!("Wrote {} reference rows to '{}'.", self.len(), path.display());
        Ok(())
    }

    /// Rebuilds an index from [`Self::write_reference`] output.
    pub fn read_reference(path: &Path) -> Result<Self, SimilarityError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let Some((target, features)) = header.split_last() else {
            return Err(SimilarityError::MalformedReference("empty header".into()));
        };
        if features.is_empty() {
            return Err(SimilarityError::MalformedReference(
                "header names no feature columns".into(),
            ));
        }

        let mut values = Vec::new();
        let mut targets = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            for (column, cell) in record.iter().enumerate() {
                let value: f64 = cell.trim().parse().map_err(|_| {
                    SimilarityError::MalformedReference(format!(
                        "row {} column '{}' holds '{}'",
                        line + 1,
                        header.get(column).map(String::as_str).unwrap_or("?"),
                        cell
                    ))
                })?;
                if column == features.len() {
                    targets.push(value);
                } else {
                    values.push(value);
                }
            }
        }
        let rows = targets.len();
        let raw = Array2::from_shape_vec((rows, features.len()), values)
            .map_err(|e| SimilarityError::MalformedReference(e.to_string()))?;
        Self::from_rows(target, features, raw, Array1::from_vec(targets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn three_records() -> SimilarityIndex {
        SimilarityIndex::from_rows(
            "interest_rate",
            &names(&["term", "all_util"]),
            array![[36.0, 0.5], [36.0, 0.52], [60.0, 0.9]],
            array![7.5, 9.0, 18.0],
        )
        .unwrap()
    }

    #[test]
    fn same_term_records_rank_ahead_of_a_longer_term() {
        let index = three_records();
        let hood = index.query(&[36.0, 0.5], 3).unwrap();
        let rows: Vec<usize> = hood.members.iter().map(|m| m.row).collect();
        assert_eq!(rows, vec![0, 1, 2]);
        assert_eq!(hood.members[0].distance, 0.0);

        let nearest_two = index.query(&[36.0, 0.5], 2).unwrap();
        assert_eq!(nearest_two.targets().collect::<Vec<_>>(), vec![7.5, 9.0]);
    }

    #[test]
    fn ties_share_the_minimum_rank_and_may_exceed_k() {
        let index = SimilarityIndex::from_rows(
            "rate",
            &names(&["x"]),
            array![[0.0], [1.0], [-1.0], [2.0], [-2.0]],
            array![1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap();
        let hood = index.query(&[0.0], 2).unwrap();
        let ranks: Vec<(usize, usize)> = hood.members.iter().map(|m| (m.row, m.rank)).collect();
        // Rows 1 and 2 are equidistant; stable order keeps row 1 first.
        assert_eq!(ranks, vec![(0, 1), (1, 2), (2, 2)]);

        let hood = index.query(&[0.0], 3).unwrap();
        assert_eq!(hood.len(), 3);
    }

    #[test]
    fn repeated_queries_return_identical_histograms() {
        let index = three_records();
        let first = index.compare(&[40.0, 0.6], 2, DEFAULT_BIN_WIDTH).unwrap();
        let second = index.compare(&[40.0, 0.6], 2, DEFAULT_BIN_WIDTH).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total(), 2);
    }

    #[test]
    fn histogram_spans_the_full_target_domain() {
        let index = three_records();
        let hist = index.compare(&[36.0, 0.5], 1, 0.5).unwrap();
        assert_eq!(hist.start, 7.5);
        // [7.5, 18.5) in half-point bins.
        assert_eq!(hist.counts.len(), 22);
        assert_eq!(hist.counts[0], 1);
        assert_eq!(hist.total(), 1);
        let last = hist.bins().last().unwrap();
        assert_eq!((last.lower, last.upper), (18.0, 18.5));
    }

    #[test]
    fn histogram_edges_are_multiples_of_the_width() {
        let hist = Histogram::from_values([5.2, 5.7, 6.9], (5.2, 6.9), 0.5).unwrap();
        assert_eq!(hist.start, 5.0);
        assert_eq!(hist.counts, vec![1, 1, 0, 1]);
        assert!(matches!(
            Histogram::from_values([1.0], (1.0, 1.0), 0.0),
            Err(SimilarityError::InvalidBinWidth(_))
        ));
    }

    #[test]
    fn queries_are_validated() {
        let index = three_records();
        assert!(matches!(index.query(&[36.0], 5), Err(SimilarityError::DimensionMismatch { .. })));
        assert!(matches!(index.query(&[36.0, 0.5], 0), Err(SimilarityError::InvalidK)));
        assert!(matches!(
            index.query(&[36.0, f64::NAN], 5),
            Err(SimilarityError::MissingValue(ref f)) if f == "all_util"
        ));
    }

    #[test]
    fn oversized_histograms_are_refused() {
        assert!(matches!(
            Histogram::from_values([5.0, 12.0], (5.0, 1e9), 0.5),
            Err(SimilarityError::TooManyBins { max: MAX_HISTOGRAM_BINS, .. })
        ));
        assert!(matches!(
            Histogram::from_values([5.0], (5.0, 30.0), 1e-6),
            Err(SimilarityError::TooManyBins { .. })
        ));
        assert!(matches!(
            Histogram::from_values([5.0], (5.0, f64::INFINITY), 0.5),
            Err(SimilarityError::TooManyBins { .. })
        ));

        // An outlier target in the reference set fails the comparison, not the process.
        let index = SimilarityIndex::from_rows(
            "rate",
            &names(&["term"]),
            array![[36.0], [36.0], [60.0]],
            Array1::from(vec![10.0, 11.0, 1e9]),
        )
        .unwrap();
        assert!(matches!(
            index.compare(&[36.0], 2, DEFAULT_BIN_WIDTH),
            Err(SimilarityError::TooManyBins { .. })
        ));
    }

    #[test]
    fn non_finite_reference_values_are_rejected() {
        let features = names(&["term", "all_util"]);
        let bad_target = SimilarityIndex::from_rows(
            "rate",
            &features,
            array![[36.0, 0.5], [60.0, 0.9]],
            Array1::from(vec![10.0, f64::NAN]),
        );
        assert!(matches!(
            bad_target,
            Err(SimilarityError::NonFiniteReference { row: 1, ref column }) if column == "rate"
        ));

        let bad_feature = SimilarityIndex::from_rows(
            "rate",
            &features,
            array![[36.0, 0.5], [60.0, f64::INFINITY]],
            Array1::from(vec![10.0, 12.0]),
        );
        assert!(matches!(
            bad_feature,
            Err(SimilarityError::NonFiniteReference { row: 1, ref column }) if column == "all_util"
        ));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reference.tsv");
        std::fs::write(&path, "term\trate\n36\t10.5\n60\tinf\n").unwrap();
        assert!(matches!(
            SimilarityIndex::read_reference(&path),
            Err(SimilarityError::NonFiniteReference { row: 1, .. })
        ));
    }

    #[test]
    fn incomplete_table_rows_are_excluded() {
        let table = ApplicantTable::new("rate", vec![10.0, 11.0, 12.0])
            .with_numeric("term", vec![Some(36.0), None, Some(60.0)])
            .unwrap();
        let index = SimilarityIndex::build(&table, &names(&["term"])).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.domain(), (10.0, 12.0));
    }

    #[test]
    fn reference_rows_survive_a_tsv_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reference.tsv");
        let index = three_records();
        index.write_reference(&path).unwrap();

        let restored = SimilarityIndex::read_reference(&path).unwrap();
        assert_eq!(restored.features(), index.features());
        assert_eq!(restored.target(), "interest_rate");
        assert_eq!(
            restored.compare(&[50.0, 0.7], 2, 0.5).unwrap(),
            index.compare(&[50.0, 0.7], 2, 0.5).unwrap()
        );
    }
}
