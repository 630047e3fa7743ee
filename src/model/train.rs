use super::cache::{Fingerprint, TreeCache};
use super::cluster::{self, Clusterer};
use super::flatten::flatten;
use super::liblinear::{self, LinearModel, LinearTrainer};
use super::tree::{build_tree, label_representation, BuildParam, Node, Tree, TreeNode};
use super::weights::{NodeModel, WeightAccumulator};
use super::TreeModel;
use crate::mat_util::*;
use crate::util::create_progress_bar;
use crate::{Error, Index, IndexValueVec, Result, SparseMat};
use bit_set::BitSet;
use const_default::ConstDefault;
use hashbrown::HashMap;
use itertools::Itertools;
use log::info;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Model training hyper-parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParam {
    /// Number of clusters each internal node splits its labels into.
    pub max_children: usize,
    pub max_depth: usize,
    /// Seed of the random source driving clustering.
    pub seed: u64,
    /// Directory of cached tree shapes; no caching if unset.
    pub cache_dir: Option<PathBuf>,
    pub linear: liblinear::HyperParam,
    pub cluster: cluster::HyperParam,
}

impl ConstDefault for HyperParam {
    const DEFAULT: Self = Self {
        max_children: 100,
        max_depth: 10,
        seed: 0,
        cache_dir: None,
        linear: liblinear::HyperParam::DEFAULT,
        cluster: cluster::HyperParam::DEFAULT,
    };
}

impl Default for HyperParam {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl HyperParam {
    /// Check if the hyper-parameter settings are valid.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(Error::InvalidHyperParam(format!(
                "max_children must be at least 2, but is {}",
                self.max_children
            )));
        }
        if self.max_depth == 0 {
            return Err(Error::InvalidHyperParam(
                "max_depth must be positive".to_owned(),
            ));
        }
        self.linear.validate()?;
        self.cluster.validate()?;
        Ok(())
    }

    /// Train a tree model with the built-in k-means clusterer and linear solver, storing the
    /// weights under `model_dir`.
    pub fn train<P: AsRef<Path>>(
        &self,
        y: &SparseMat,
        x: &SparseMat,
        model_dir: P,
    ) -> Result<TreeModel> {
        self.validate()?;
        TreeTrainer::new(self, &self.cluster, &self.linear).train(y, x, model_dir)
    }
}

/// Train a tree model the way a one-off script would: parse liblinear-style `options`, cache
/// tree shapes under `tree_cache/` and write the weights to a fresh `weights/<uuid>/` directory.
pub fn train(
    y: &SparseMat,
    x: &SparseMat,
    options: &str,
    max_children: usize,
    max_depth: usize,
) -> Result<TreeModel> {
    let hyper_param = HyperParam {
        max_children,
        max_depth,
        cache_dir: Some(PathBuf::from("tree_cache")),
        linear: liblinear::HyperParam::from_options(options)?,
        ..HyperParam::DEFAULT
    };
    let model_dir = Path::new("weights").join(Uuid::new_v4().simple().to_string());
    hyper_param.train(y, x, model_dir)
}

/// Builds the label tree and trains a classifier for every node of it.
pub struct TreeTrainer<'a, C: Clusterer + ?Sized, L: LinearTrainer + ?Sized> {
    hyper_param: &'a HyperParam,
    clusterer: &'a C,
    linear_trainer: &'a L,
}

impl<'a, C, L> TreeTrainer<'a, C, L>
where
    C: Clusterer + ?Sized,
    L: LinearTrainer + ?Sized,
{
    pub fn new(hyper_param: &'a HyperParam, clusterer: &'a C, linear_trainer: &'a L) -> Self {
        Self {
            hyper_param,
            clusterer,
            linear_trainer,
        }
    }

    /// Build the tree shape, reusing a cached one for identical inputs if caching is enabled.
    pub fn build_shape(&self, y: &SparseMat, x: &SparseMat) -> Result<TreeNode> {
        let build = || {
            let start_t = time::precise_time_s();
            let label_repr = label_representation(y, x);
            let param = BuildParam {
                max_children: self.hyper_param.max_children,
                max_depth: self.hyper_param.max_depth,
            };
            let root = build_tree(
                &label_repr,
                (0..y.cols() as Index).collect(),
                0,
                &param,
                self.clusterer,
                &mut StdRng::seed_from_u64(self.hyper_param.seed),
            );
            info!(
                "Built tree with {} nodes over {} labels; it took {:.2}s",
                root.n_nodes(),
                y.cols(),
                time::precise_time_s() - start_t
            );
            root
        };

        match self.hyper_param.cache_dir {
            Some(ref dir) => TreeCache::new(dir)
                .get_or_build(&Fingerprint::new(y, x, self.hyper_param), build),
            None => Ok(build()),
        }
    }

    /// Train the whole model and save it to `model_dir`.
    ///
    /// Nodes are trained one at a time in depth-first order, each node's weights streamed to
    /// disk as soon as they are trained. If training fails midway, the partially written files
    /// in `model_dir` are left for the caller to remove.
    pub fn train<P: AsRef<Path>>(
        &self,
        y: &SparseMat,
        x: &SparseMat,
        model_dir: P,
    ) -> Result<TreeModel> {
        assert!(y.is_csr());
        assert!(x.is_csr());
        if y.rows() != x.rows() {
            return Err(Error::ShapeMismatch(format!(
                "label matrix has {} rows but feature matrix has {}",
                y.rows(),
                x.rows()
            )));
        }
        let model_dir = model_dir.as_ref();
        fs::create_dir_all(model_dir)?;

        let tree = Tree::from_shape(&self.build_shape(y, x)?);
        info!(
            "Training classifiers for {} nodes on {} examples",
            tree.len(),
            y.rows()
        );
        let start_t = time::precise_time_s();
        let mut pb = create_progress_bar(tree.len() as u64);

        // The number of weight rows is only known once a classifier has been trained
        let root_model = self.train_node(&tree, tree.root(), y, x);
        pb.inc();
        let mut accumulator =
            WeightAccumulator::create(model_dir, tree.len(), root_model.weights.rows())?;
        let mut node_models = Vec::with_capacity(tree.len());
        node_models.push(stream_weights(&mut accumulator, root_model)?);
        for node in &tree.nodes()[1..] {
            let model = self.train_node(&tree, node, y, x);
            node_models.push(stream_weights(&mut accumulator, model)?);
            pb.inc();
        }
        pb.finish();
        info!(
            "Trained {} node classifiers with {} non-zero weights in total; it took {:.2}s",
            tree.len(),
            accumulator.nnz(),
            time::precise_time_s() - start_t
        );

        let (flat_model, weight_map) = flatten(
            &tree,
            &node_models,
            &accumulator,
            &model_dir.join("flat_model"),
        )?;
        accumulator.remove_files()?;

        let model = TreeModel::new(
            tree,
            flat_model,
            weight_map,
            model_dir.to_path_buf(),
            x.cols(),
        );
        model.save()?;
        Ok(model)
    }

    /// Train a node's classifier on the examples with at least one of its labels.
    ///
    /// A leaf predicts its own labels; an internal node predicts, for each child, whether an
    /// example has any label under that child.
    fn train_node(&self, tree: &Tree, node: &Node, y: &SparseMat, x: &SparseMat) -> LinearModel {
        let label_set = node
            .label_map()
            .iter()
            .map(|&l| l as usize)
            .collect::<BitSet>();
        let rows = y.outer_dims_with_any_inner(&label_set);
        let node_y = y.copy_outer_dims(&rows);
        let node_x = x.copy_outer_dims(&rows);

        let (label_to_output, n_outputs) = match node {
            Node::Leaf { label_map } => (
                label_map
                    .iter()
                    .enumerate()
                    .map(|(j, &l)| (l, j))
                    .collect::<HashMap<_, _>>(),
                label_map.len(),
            ),
            Node::Internal { children, .. } => (
                children
                    .iter()
                    .enumerate()
                    .flat_map(|(j, &c)| tree.node(c).label_map().iter().map(move |&l| (l, j)))
                    .collect::<HashMap<_, _>>(),
                children.len(),
            ),
        };

        let targets = node_y
            .outer_iterator()
            .map(|row| {
                let mut outputs = row
                    .iter()
                    .filter(|&(_, &v)| v != 0.)
                    .filter_map(|(l, _)| label_to_output.get(&(l as Index)).cloned())
                    .collect_vec();
                outputs.sort_unstable();
                outputs.dedup();
                outputs
                    .into_iter()
                    .map(|j| (j as Index, 1.))
                    .collect::<IndexValueVec>()
            })
            .collect_vec()
            .copy_to_csrmat(n_outputs);

        self.linear_trainer.train_one_vs_rest(&targets, &node_x)
    }
}

fn stream_weights(accumulator: &mut WeightAccumulator, model: LinearModel) -> Result<NodeModel> {
    Ok(NodeModel {
        bias: model.bias,
        weights: accumulator.append(model.weights)?,
    })
}
