mod cache;
pub mod cluster;
pub mod eval;
mod flatten;
pub mod liblinear;
pub mod train;
pub mod tree;
mod weights;

pub use self::cache::{Fingerprint, TreeCache};
pub use self::train::HyperParam as TrainHyperParam;

use self::flatten::{FlatModel, MappedCsr};
use self::tree::{Node, Tree};
use crate::{DenseMat, Error, Index, IndexValueVec, Result, SparseMat};
use itertools::Itertools;
use log::info;
use ndarray::{ArrayView1, ArrayViewMut1, Axis};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const TREE_FILE: &str = "tree.json";
const SETTINGS_FILE: &str = "settings.json";
const FLAT_MODEL_PREFIX: &str = "flat_model";

/// A trained label tree whose node classifiers are merged into one memory-mapped weight matrix.
pub struct TreeModel {
    tree: Tree,
    flat_model: FlatModel,
    weight_map: Vec<usize>,
    model_dir: PathBuf,
    n_features: usize,
}

/// Everything needed to re-open a saved model besides the tree and the mapped arrays.
#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    n_features: usize,
    n_labels: usize,
    n_nodes: usize,
    shape: (usize, usize),
    nnz: usize,
    bias: f32,
    weight_map: Vec<usize>,
}

/// The number of weight matrix columns node `i` must own.
fn n_node_outputs(node: &Node) -> usize {
    match node {
        Node::Leaf { label_map } => label_map.len(),
        Node::Internal { children, .. } => children.len(),
    }
}

fn check_weight_map(
    tree: &Tree,
    weight_map: &[usize],
    n_cols: usize,
) -> std::result::Result<(), String> {
    if weight_map.len() != tree.len() + 1 {
        return Err(format!(
            "weight map has {} entries for {} nodes",
            weight_map.len(),
            tree.len()
        ));
    }
    if weight_map[0] != 0 || weight_map[tree.len()] != n_cols {
        return Err(format!(
            "weight map must span columns 0..{}, but spans {}..{}",
            n_cols,
            weight_map[0],
            weight_map[tree.len()]
        ));
    }
    for (i, node) in tree.nodes().iter().enumerate() {
        let n_cols = weight_map[i + 1].saturating_sub(weight_map[i]);
        if weight_map[i + 1] <= weight_map[i] || n_cols != n_node_outputs(node) {
            return Err(format!(
                "node {} owns {} columns but has {} outputs",
                i,
                n_cols,
                n_node_outputs(node)
            ));
        }
    }
    Ok(())
}

/// The change in a path's score when moving to a node with the given decision value, i.e. the
/// negated squared hinge loss of predicting that the node is relevant.
#[inline]
fn score_increment(pred: f32) -> f32 {
    -(1. - pred).max(0.).powi(2)
}

impl TreeModel {
    pub(crate) fn new(
        tree: Tree,
        flat_model: FlatModel,
        weight_map: Vec<usize>,
        model_dir: PathBuf,
        n_features: usize,
    ) -> Self {
        let (n_rows, n_cols) = flat_model.weights.shape();
        if let Err(msg) = check_weight_map(&tree, &weight_map, n_cols) {
            panic!("Inconsistent tree model: {}", msg);
        }
        assert_eq!(
            n_features + (flat_model.bias > 0.) as usize,
            n_rows,
            "Weight matrix rows do not match the number of features"
        );
        Self {
            tree,
            flat_model,
            weight_map,
            model_dir,
            n_features,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Column offsets of each node's weights in the flattened weight matrix.
    pub fn weight_map(&self) -> &[usize] {
        &self.weight_map
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_labels(&self) -> usize {
        self.tree.n_labels()
    }

    pub fn bias(&self) -> f32 {
        self.flat_model.bias
    }

    fn has_bias(&self) -> bool {
        self.flat_model.bias > 0.
    }

    /// Compute the decision values of every node output for each row of `x`.
    ///
    /// Features beyond those the model was trained with are ignored. Returns an example-by-column
    /// matrix whose columns are laid out as given by [`weight_map`](Self::weight_map).
    pub fn predict_values(&self, x: &SparseMat) -> DenseMat {
        assert!(x.is_csr());
        let weights = self.flat_model.weights.as_block();
        let mut outputs = DenseMat::zeros((x.rows(), weights.n_cols()));
        outputs
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut output)| {
                let mut add_row = |feature: usize, value: f32| {
                    let (indices, data) = weights.row(feature);
                    for (&j, &w) in indices.iter().zip(data.iter()) {
                        output[j as usize] += value * w;
                    }
                };
                if let Some(row) = x.outer_view(i) {
                    for (feature, &value) in row.iter() {
                        if feature < self.n_features {
                            add_row(feature, value);
                        }
                    }
                }
                if self.has_bias() {
                    add_row(self.n_features, self.flat_model.bias);
                }
            });
        outputs
    }

    /// Score every label for each row of `x` by beam search down the tree.
    ///
    /// Labels outside the leaves that survive the search are scored negative infinity.
    pub fn predict(&self, x: &SparseMat, beam_width: usize) -> DenseMat {
        assert!(beam_width > 0);
        let all_preds = self.predict_values(x);
        let mut scores = DenseMat::from_elem((x.rows(), self.n_labels()), f32::NEG_INFINITY);
        scores
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(all_preds.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut instance_scores, instance_preds)| {
                self.beam_search(instance_preds, beam_width, &mut instance_scores)
            });
        scores
    }

    /// Predict the `k` highest-scoring labels for each row of `x`, sorted by descending score.
    pub fn predict_top_k(&self, x: &SparseMat, beam_width: usize, k: usize) -> Vec<IndexValueVec> {
        let scores = self.predict(x, beam_width);
        scores
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|instance_scores| top_k(instance_scores, k))
            .collect()
    }

    fn beam_search(
        &self,
        instance_preds: ArrayView1<f32>,
        beam_width: usize,
        scores: &mut ArrayViewMut1<f32>,
    ) {
        let node_preds = |index: usize| {
            instance_preds.slice(ndarray::s![self.weight_map[index]..self.weight_map[index + 1]])
        };

        let mut curr_level = vec![(0usize, 0f32)];
        let mut next_level = Vec::with_capacity(beam_width * 2);
        while curr_level
            .iter()
            .any(|&(index, _)| !self.tree.node(index).is_leaf())
        {
            next_level.clear();
            for &(index, score) in &curr_level {
                match self.tree.node(index) {
                    Node::Leaf { .. } => next_level.push((index, score)),
                    Node::Internal { children, .. } => {
                        for (&child, &pred) in children.iter().zip(node_preds(index).iter()) {
                            next_level.push((child, score + score_increment(pred)));
                        }
                    }
                }
            }

            // Stable, so ties keep their emission order
            next_level.sort_by(|(_, score1), (_, score2)| score2.total_cmp(score1));
            next_level.truncate(beam_width);
            std::mem::swap(&mut curr_level, &mut next_level);
        }

        for &(index, score) in &curr_level {
            let label_map = self.tree.node(index).label_map();
            for (&label, &pred) in label_map.iter().zip(node_preds(index).iter()) {
                scores[label as usize] = (score + score_increment(pred)).exp();
            }
        }
    }

    /// Write the tree and the settings needed to re-open the weights into the model directory.
    pub fn save(&self) -> Result<()> {
        info!("Saving model to {}", self.model_dir.display());
        let start_t = time::precise_time_s();
        self.flat_model.weights.flush()?;

        let mut writer = BufWriter::new(File::create(self.model_dir.join(TREE_FILE))?);
        serde_json::to_writer(&mut writer, &self.tree)?;
        writer.flush()?;

        let (n_rows, n_cols) = self.flat_model.weights.shape();
        let settings = Settings {
            n_features: self.n_features,
            n_labels: self.n_labels(),
            n_nodes: self.tree.len(),
            shape: (n_rows, n_cols),
            nnz: self.flat_model.weights.nnz(),
            bias: self.flat_model.bias,
            weight_map: self.weight_map.clone(),
        };
        let mut writer = BufWriter::new(File::create(self.model_dir.join(SETTINGS_FILE))?);
        serde_json::to_writer_pretty(&mut writer, &settings)?;
        writer.flush()?;

        info!(
            "Model saved; it took {:.2}s",
            time::precise_time_s() - start_t
        );
        Ok(())
    }

    /// Re-open a model saved in the given directory, without loading the weights into memory.
    pub fn load<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        info!("Loading model from {}", model_dir.display());
        let start_t = time::precise_time_s();

        let settings: Settings = serde_json::from_reader(BufReader::new(File::open(
            model_dir.join(SETTINGS_FILE),
        )?))?;
        let tree: Tree =
            serde_json::from_reader(BufReader::new(File::open(model_dir.join(TREE_FILE))?))?;
        if tree.len() != settings.n_nodes || tree.n_labels() != settings.n_labels {
            return Err(Error::InvalidModel(format!(
                "tree has {} nodes and {} labels, but settings expect {} and {}",
                tree.len(),
                tree.n_labels(),
                settings.n_nodes,
                settings.n_labels
            )));
        }
        check_weight_map(&tree, &settings.weight_map, settings.shape.1)
            .map_err(Error::InvalidModel)?;
        if settings.shape.0 != settings.n_features + (settings.bias > 0.) as usize {
            return Err(Error::InvalidModel(format!(
                "weight matrix has {} rows for {} features",
                settings.shape.0, settings.n_features
            )));
        }

        let weights = MappedCsr::open(
            &model_dir.join(FLAT_MODEL_PREFIX),
            settings.shape,
            settings.nnz,
        )?;
        let model = Self::new(
            tree,
            FlatModel {
                weights,
                bias: settings.bias,
            },
            settings.weight_map,
            model_dir.to_path_buf(),
            settings.n_features,
        );
        info!(
            "Loaded model with {} nodes; it took {:.2}s",
            model.tree.len(),
            time::precise_time_s() - start_t
        );
        Ok(model)
    }
}

/// The `k` highest finite scores with their labels, in descending order.
fn top_k(scores: ArrayView1<f32>, k: usize) -> IndexValueVec {
    let mut pairs = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .map(|(label, &score)| (label as Index, score))
        .collect_vec();
    if k == 0 {
        return Vec::new();
    }
    let descending = |a: &(Index, f32), b: &(Index, f32)| OrderedFloat(b.1).cmp(&OrderedFloat(a.1));
    if pairs.len() > k {
        order_stat::kth_by(&mut pairs, k - 1, descending);
        pairs.truncate(k);
    }
    pairs.sort_by(descending);
    pairs
}
