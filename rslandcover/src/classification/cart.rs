use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::classification::scene::Scene;
use crate::classification::training::TrainingSet;
use crate::error::{ClassificationError, Result};
use crate::raster::Raster;

/// Band name of classifier output
pub const CLASSIFICATION_BAND: &str = "classification";

/// Minimum impurity decrease for a split to be kept
const MIN_DECREASE: f64 = 1e-12;

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Tree node; children are indices into the tree's node arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        label: i32,
    },
    /// `value <= threshold` goes left
    Split {
        band: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// CART classifier mapping a band-value vector to a class code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    bands: Vec<String>,
    label_field: String,
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Grow a tree on the whole training set
    ///
    /// Recursive binary splitting on band thresholds minimising Gini
    /// impurity, grown until leaves are pure or no split lowers impurity.
    /// Thresholds sit halfway between consecutive distinct values. Leaves
    /// hold the majority label, ties going to the smallest code. There are
    /// no tunable parameters and no validation split.
    pub fn train(set: &TrainingSet, label_field: &str, band_list: &[String]) -> Result<Self> {
        if set.is_empty() {
            return Err(ClassificationError::EmptyTrainingSet);
        }
        if label_field != set.label_field() {
            return Err(ClassificationError::UnknownLabelField {
                expected: set.label_field().to_string(),
                found: label_field.to_string(),
            });
        }
        if band_list.is_empty() {
            return Err(ClassificationError::BandMismatch(
                "no band to train on".to_string(),
            ));
        }
        let columns = band_list
            .iter()
            .map(|band| {
                set.band_index(band).ok_or_else(|| {
                    ClassificationError::BandMismatch(format!(
                        "band '{}' not in training set (available: {:?})",
                        band,
                        set.bands()
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let classes: Vec<i32> = set
            .records()
            .iter()
            .map(|r| r.label)
            .collect::<BTreeSet<i32>>()
            .into_iter()
            .collect();
        let targets: Vec<usize> = set
            .records()
            .iter()
            .map(|r| classes.binary_search(&r.label).unwrap_or(0))
            .collect();
        let features: Vec<Vec<f64>> = columns
            .iter()
            .map(|&c| set.records().iter().map(|r| r.values[c]).collect())
            .collect();

        let mut nodes = vec![Node::Leaf { label: classes[0] }];
        let mut stack: Vec<(usize, Vec<usize>)> = vec![(0, (0..set.len()).collect())];
        while let Some((node, rows)) = stack.pop() {
            let counts = class_counts(&rows, &targets, classes.len());
            let label = classes[majority(&counts)];
            let split = if counts.iter().filter(|&&c| c > 0).count() > 1 {
                best_split(&rows, &targets, &features, &counts)
            } else {
                None
            };
            match split {
                Some((band, threshold)) => {
                    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                        .iter()
                        .copied()
                        .partition(|&r| features[band][r] <= threshold);
                    let left = nodes.len();
                    let right = left + 1;
                    nodes.push(Node::Leaf { label });
                    nodes.push(Node::Leaf { label });
                    nodes[node] = Node::Split {
                        band,
                        threshold,
                        left,
                        right,
                    };
                    stack.push((right, right_rows));
                    stack.push((left, left_rows));
                }
                None => nodes[node] = Node::Leaf { label },
            }
        }

        let tree = DecisionTree {
            bands: band_list.to_vec(),
            label_field: label_field.to_string(),
            nodes,
        };
        info!(
            records = set.len(),
            classes = classes.len(),
            depth = tree.depth(),
            leaves = tree.leaf_count(),
            "decision tree trained"
        );
        Ok(tree)
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn label_field(&self) -> &str {
        &self.label_field
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Class code of one band-value vector, ordered as [`DecisionTree::bands`]
    pub fn predict(&self, values: &[f64]) -> i32 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { label } => return *label,
                Node::Split {
                    band,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if values[*band] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Number of splits on the longest root-to-leaf path
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((idx, depth)) = stack.pop() {
            match &self.nodes[idx] {
                Node::Leaf { .. } => deepest = deepest.max(depth),
                Node::Split { left, right, .. } => {
                    stack.push((*left, depth + 1));
                    stack.push((*right, depth + 1));
                }
            }
        }
        deepest
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

fn class_counts(rows: &[usize], targets: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0usize; n_classes];
    for &r in rows {
        counts[targets[r]] += 1;
    }
    counts
}

/// Index of the most frequent class, lowest index on ties
fn majority(counts: &[usize]) -> usize {
    let mut best = 0;
    for (i, &c) in counts.iter().enumerate() {
        if c > counts[best] {
            best = i;
        }
    }
    best
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}

/// Lowest weighted Gini split over every band and threshold
///
/// Returns `None` unless impurity strictly decreases.
fn best_split(
    rows: &[usize],
    targets: &[usize],
    features: &[Vec<f64>],
    counts: &[usize],
) -> Option<(usize, f64)> {
    let total = rows.len();
    let parent = gini(counts, total);
    let mut best: Option<(usize, f64, f64)> = None;

    for (band, column) in features.iter().enumerate() {
        let mut sorted = rows.to_vec();
        sorted.sort_by(|&a, &b| column[a].total_cmp(&column[b]));

        let mut left = vec![0usize; counts.len()];
        let mut right = counts.to_vec();
        for i in 0..total - 1 {
            let t = targets[sorted[i]];
            left[t] += 1;
            right[t] -= 1;
            let v = column[sorted[i]];
            let next = column[sorted[i + 1]];
            if v >= next {
                continue;
            }
            let n_left = i + 1;
            let n_right = total - n_left;
            let impurity = (n_left as f64 * gini(&left, n_left)
                + n_right as f64 * gini(&right, n_right))
                / total as f64;
            if best.map_or(true, |(_, _, b)| impurity < b) {
                let mid = v + (next - v) / 2.0;
                let threshold = if mid < next { mid } else { v };
                best = Some((band, threshold, impurity));
            }
        }
    }

    best.filter(|&(_, _, impurity)| parent - impurity > MIN_DECREASE)
        .map(|(band, threshold, _)| (band, threshold))
}

/// Single-band raster of class codes on a scene grid
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRaster {
    raster: Raster,
}

impl ClassifiedRaster {
    /// Wrap a raster holding exactly the classification band
    pub fn from_raster(raster: Raster) -> Result<Self> {
        if raster.bands().len() != 1 || raster.bands()[0].name != CLASSIFICATION_BAND {
            return Err(ClassificationError::BandMismatch(format!(
                "classified raster must hold the single band '{}', found {:?}",
                CLASSIFICATION_BAND,
                raster.band_names()
            )));
        }
        Ok(ClassifiedRaster { raster })
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn raster_mut(&mut self) -> &mut Raster {
        &mut self.raster
    }

    pub fn into_raster(self) -> Raster {
        self.raster
    }

    pub fn code_at(&self, row: usize, col: usize) -> Option<i32> {
        let value = self.raster.bands()[0].data[self.raster.grid().index(row, col)];
        value.is_finite().then(|| value.round() as i32)
    }

    /// Codes present in the raster, nodata excluded
    pub fn distinct_codes(&self) -> BTreeSet<i32> {
        self.raster.bands()[0]
            .data
            .iter()
            .filter(|v| v.is_finite())
            .map(|v| v.round() as i32)
            .collect()
    }
}

/// Apply `model` to every pixel of `scene`
///
/// `band_list` must be the model's band list and every band must exist in
/// the scene. Pixels with nodata in any band stay nodata.
pub fn classify(model: &DecisionTree, scene: &Scene, band_list: &[String]) -> Result<ClassifiedRaster> {
    if band_list != model.bands() {
        return Err(ClassificationError::BandMismatch(format!(
            "classifier was trained on {:?}, asked to classify with {:?}",
            model.bands(),
            band_list
        )));
    }
    let raster = scene.raster();
    let bands = band_list
        .iter()
        .map(|name| {
            raster.band(name).ok_or_else(|| {
                ClassificationError::BandMismatch(format!(
                    "band '{}' not in scene '{}' (available: {:?})",
                    name,
                    scene.id(),
                    raster.band_names()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let grid = *raster.grid();

    #[cfg(feature = "indicatif")]
    let pb = {
        let pb = ProgressBar::new(grid.height as u64);
        pb.set_style(progress_style());
        pb.set_message("Classifying rows");
        pb
    };

    let classify_row = |row: usize| -> Vec<f32> {
        let mut values = vec![0.0f64; bands.len()];
        let out = (0..grid.width)
            .map(|col| {
                let idx = grid.index(row, col);
                for (slot, band) in values.iter_mut().zip(&bands) {
                    *slot = band.data[idx] as f64;
                }
                if values.iter().all(|v| v.is_finite()) {
                    model.predict(&values) as f32
                } else {
                    f32::NAN
                }
            })
            .collect();
        #[cfg(feature = "indicatif")]
        pb.inc(1);
        out
    };

    #[cfg(feature = "rayon")]
    let rows: Vec<Vec<f32>> = (0..grid.height).into_par_iter().map(classify_row).collect();

    #[cfg(not(feature = "rayon"))]
    let rows: Vec<Vec<f32>> = (0..grid.height).map(classify_row).collect();

    #[cfg(feature = "indicatif")]
    pb.finish_and_clear();

    let data: Vec<f32> = rows.into_iter().flatten().collect();
    let classified = Raster::new(grid).with_band(CLASSIFICATION_BAND, data)?;
    let result = ClassifiedRaster::from_raster(classified)?;
    debug!(codes = ?result.distinct_codes(), "classified codes");
    info!(
        scene = %scene.id(),
        width = grid.width,
        height = grid.height,
        valid = result.raster().valid_count(),
        "scene classified"
    );
    Ok(result)
}
