use super::cluster::Clusterer;
use crate::mat_util::*;
use crate::{Index, SparseMat};
use hashbrown::HashMap;
use log::debug;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// The shape of a (sub)tree over a set of labels, without any classifier weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        label_map: Vec<Index>,
    },
    Internal {
        label_map: Vec<Index>,
        children: Vec<TreeNode>,
    },
}

impl TreeNode {
    pub fn label_map(&self) -> &[Index] {
        match self {
            TreeNode::Leaf { label_map } | TreeNode::Internal { label_map, .. } => label_map,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, TreeNode::Leaf { .. })
    }

    /// Visit the nodes in depth-first pre-order.
    pub fn dfs<'a>(&'a self, visit: &mut impl FnMut(&'a TreeNode)) {
        visit(self);
        if let TreeNode::Internal { children, .. } = self {
            for child in children {
                child.dfs(visit);
            }
        }
    }

    pub fn n_nodes(&self) -> usize {
        let mut n = 0;
        self.dfs(&mut |_| n += 1);
        n
    }
}

/// A node stored in the tree arena; children are referred to by arena position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        label_map: Vec<Index>,
    },
    Internal {
        label_map: Vec<Index>,
        children: Vec<usize>,
    },
}

impl Node {
    pub fn label_map(&self) -> &[Index] {
        match self {
            Node::Leaf { label_map } | Node::Internal { label_map, .. } => label_map,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// A tree laid out in an arena in depth-first pre-order, so that a node's index is both its
/// position in the arena and its position in the flattened weight matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn from_shape(root: &TreeNode) -> Self {
        let mut nodes = Vec::with_capacity(root.n_nodes());
        Self::push_subtree(root, &mut nodes);
        Self { nodes }
    }

    fn push_subtree(node: &TreeNode, nodes: &mut Vec<Node>) -> usize {
        let index = nodes.len();
        match node {
            TreeNode::Leaf { label_map } => nodes.push(Node::Leaf {
                label_map: label_map.clone(),
            }),
            TreeNode::Internal {
                label_map,
                children,
            } => {
                nodes.push(Node::Internal {
                    label_map: label_map.clone(),
                    children: Vec::with_capacity(children.len()),
                });
                let child_indices = children
                    .iter()
                    .map(|child| Self::push_subtree(child, nodes))
                    .collect::<Vec<_>>();
                if let Node::Internal { children, .. } = &mut nodes[index] {
                    *children = child_indices;
                }
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of labels covered by the tree, i.e. by its root.
    pub fn n_labels(&self) -> usize {
        self.root().label_map().len()
    }

    /// Length of the longest root-to-leaf path, counted in edges.
    pub fn depth(&self) -> usize {
        let mut depths = vec![0usize; self.len()];
        let mut max_depth = 0;
        // Parents always precede their children in pre-order
        for (i, node) in self.nodes.iter().enumerate() {
            if let Node::Internal { children, .. } = node {
                for &c in children {
                    depths[c] = depths[i] + 1;
                    max_depth = max_depth.max(depths[c]);
                }
            }
        }
        max_depth
    }

    pub fn max_branching(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Leaf { .. } => 0,
                Node::Internal { children, .. } => children.len(),
            })
            .max()
            .unwrap_or(0)
    }

    pub fn leaves(&self) -> impl Iterator<Item = (usize, &[Index])> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf())
            .map(|(i, node)| (i, node.label_map()))
    }
}

/// Compute a feature vector for each label as the l2-normalized sum of the feature vectors of
/// the examples carrying it.
///
/// Returns a label-by-feature matrix; labels without examples get empty rows.
pub fn label_representation(y: &SparseMat, x: &SparseMat) -> SparseMat {
    assert!(y.is_csr());
    assert!(x.is_csr());
    assert_eq!(y.rows(), x.rows());

    let mut label_to_feature_to_sum = vec![HashMap::<Index, f32>::new(); y.cols()];
    for (labels, features) in y.outer_iterator().zip(x.outer_iterator()) {
        for &label in labels.indices() {
            let feature_to_sum = &mut label_to_feature_to_sum[label as usize];
            for (feature, &value) in features.iter() {
                *feature_to_sum.entry(feature as Index).or_default() += value;
            }
        }
    }

    let rows = label_to_feature_to_sum
        .into_iter()
        .map(|feature_to_sum| {
            let mut v = feature_to_sum.into_iter().collect::<Vec<_>>();
            v.sort_by_index();
            v.l2_normalize();
            v
        })
        .collect::<Vec<_>>();
    rows.copy_to_csrmat(x.cols())
}

/// Settings for recursively partitioning labels.
#[derive(Copy, Clone, Debug)]
pub struct BuildParam {
    pub max_children: usize,
    pub max_depth: usize,
}

/// Recursively partition labels into a tree by clustering their representations.
///
/// A node becomes a leaf once it reaches the maximum depth or holds no more labels than the
/// number of clusters. Clusters that come out empty do not produce children.
pub fn build_tree<C: Clusterer + ?Sized>(
    label_repr: &SparseMat,
    label_map: Vec<Index>,
    depth: usize,
    param: &BuildParam,
    clusterer: &C,
    rng: &mut StdRng,
) -> TreeNode {
    assert_eq!(label_repr.rows(), label_map.len());
    if depth >= param.max_depth || label_map.len() <= param.max_children {
        return TreeNode::Leaf { label_map };
    }

    let assignments = clusterer.cluster(label_repr, param.max_children, rng.gen());
    assert_eq!(assignments.len(), label_map.len());

    let mut cluster_rows = vec![Vec::<usize>::new(); param.max_children];
    for (i, &c) in assignments.iter().enumerate() {
        cluster_rows[c].push(i);
    }

    let children = cluster_rows
        .into_iter()
        .filter(|rows| !rows.is_empty())
        .map(|rows| {
            let child_repr = label_repr.copy_outer_dims(&rows);
            let child_map = rows.iter().map(|&i| label_map[i]).collect();
            build_tree(&child_repr, child_map, depth + 1, param, clusterer, rng)
        })
        .collect::<Vec<_>>();
    debug!(
        "Split {} labels at depth {} into {} clusters",
        label_map.len(),
        depth,
        children.len()
    );

    TreeNode::Internal {
        label_map,
        children,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use const_default::ConstDefault;
    use crate::model::cluster;
    use hashbrown::HashSet;

    pub(crate) fn assert_partition_invariants(root: &TreeNode, n_labels: usize) {
        let mut leaf_labels = Vec::new();
        root.dfs(&mut |node| match node {
            TreeNode::Leaf { label_map } => {
                assert!(!label_map.is_empty());
                leaf_labels.extend_from_slice(label_map);
            }
            TreeNode::Internal {
                label_map,
                children,
            } => {
                assert!(!children.is_empty());
                let mut union = Vec::new();
                for child in children {
                    assert!(!child.label_map().is_empty());
                    union.extend_from_slice(child.label_map());
                }
                let union_set = union.iter().cloned().collect::<HashSet<_>>();
                assert_eq!(union.len(), union_set.len(), "children overlap");
                assert_eq!(
                    label_map.iter().cloned().collect::<HashSet<_>>(),
                    union_set
                );
            }
        });
        leaf_labels.sort_unstable();
        assert_eq!((0..n_labels as Index).collect::<Vec<_>>(), leaf_labels);
    }

    fn synthetic_label_repr(n_labels: usize, n_groups: usize) -> SparseMat {
        (0..n_labels)
            .map(|l| {
                let mut v = vec![((l % n_groups) as Index, 1.), ((n_groups + l) as Index, 0.2)];
                v.l2_normalize();
                v
            })
            .collect::<Vec<_>>()
            .copy_to_csrmat(n_groups + n_labels)
    }

    #[test]
    fn test_build_tree_partitions_labels() {
        let n_labels = 50;
        let label_repr = synthetic_label_repr(n_labels, 4);
        let param = BuildParam {
            max_children: 4,
            max_depth: 3,
        };
        let root = build_tree(
            &label_repr,
            (0..n_labels as Index).collect(),
            0,
            &param,
            &cluster::HyperParam::DEFAULT,
            &mut StdRng::seed_from_u64(1),
        );
        assert_partition_invariants(&root, n_labels);

        let tree = Tree::from_shape(&root);
        assert!(tree.depth() <= 3);
        assert!(tree.max_branching() <= 4);
        assert_eq!(root.n_nodes(), tree.len());
    }

    #[test]
    fn test_build_tree_base_cases() {
        let label_repr = synthetic_label_repr(10, 2);
        let labels = (0..10).collect::<Vec<Index>>();
        let clusterer = cluster::HyperParam::DEFAULT;
        let mut rng = StdRng::seed_from_u64(0);

        let few_labels = BuildParam {
            max_children: 10,
            max_depth: 5,
        };
        assert_eq!(
            TreeNode::Leaf {
                label_map: labels.clone()
            },
            build_tree(&label_repr, labels.clone(), 0, &few_labels, &clusterer, &mut rng)
        );

        let too_deep = BuildParam {
            max_children: 2,
            max_depth: 1,
        };
        assert!(build_tree(&label_repr, labels.clone(), 1, &too_deep, &clusterer, &mut rng).is_leaf());
    }

    struct FixedClusterer;

    impl Clusterer for FixedClusterer {
        fn cluster(&self, points: &SparseMat, _k: usize, _seed: u64) -> Vec<usize> {
            // Only ever use clusters 0 and 2, leaving 1 empty
            (0..points.rows()).map(|i| if i % 2 == 0 { 0 } else { 2 }).collect()
        }
    }

    #[test]
    fn test_build_tree_skips_empty_clusters() {
        let label_repr = synthetic_label_repr(6, 2);
        let param = BuildParam {
            max_children: 3,
            max_depth: 1,
        };
        let root = build_tree(
            &label_repr,
            (10..16).collect(),
            0,
            &param,
            &FixedClusterer,
            &mut StdRng::seed_from_u64(0),
        );
        assert_eq!(
            TreeNode::Internal {
                label_map: vec![10, 11, 12, 13, 14, 15],
                children: vec![
                    TreeNode::Leaf {
                        label_map: vec![10, 12, 14]
                    },
                    TreeNode::Leaf {
                        label_map: vec![11, 13, 15]
                    },
                ],
            },
            root
        );
    }

    #[test]
    fn test_tree_arena_is_in_preorder() {
        let root = TreeNode::Internal {
            label_map: vec![0, 1, 2, 3],
            children: vec![
                TreeNode::Internal {
                    label_map: vec![0, 1, 2],
                    children: vec![
                        TreeNode::Leaf {
                            label_map: vec![0, 2],
                        },
                        TreeNode::Leaf { label_map: vec![1] },
                    ],
                },
                TreeNode::Leaf { label_map: vec![3] },
            ],
        };
        let tree = Tree::from_shape(&root);
        assert_eq!(5, tree.len());
        assert_eq!(
            &Node::Internal {
                label_map: vec![0, 1, 2, 3],
                children: vec![1, 4],
            },
            tree.root()
        );
        assert_eq!(
            &Node::Internal {
                label_map: vec![0, 1, 2],
                children: vec![2, 3],
            },
            tree.node(1)
        );
        assert_eq!(
            vec![(2, &[0, 2][..]), (3, &[1][..]), (4, &[3][..])],
            tree.leaves().collect::<Vec<_>>()
        );
        assert_eq!(2, tree.depth());
        assert_eq!(2, tree.max_branching());
        assert_eq!(4, tree.n_labels());
    }

    #[test]
    fn test_label_representation() {
        let x = vec![
            vec![(0, 1.), (2, 2.)],
            vec![(1, 1.), (3, 2.)],
            vec![(0, 1.), (3, 2.)],
        ]
        .copy_to_csrmat(4);
        let y = vec![
            vec![(0, 1.), (1, 1.)],
            vec![(0, 1.), (2, 1.)],
            vec![(1, 1.), (2, 1.)],
            // Label 3 never occurs
        ]
        .copy_to_csrmat(4);

        let repr = label_representation(&y, &x).to_dense();
        let expected = [
            [1. / 10f32.sqrt(), 1. / 10f32.sqrt(), 2. / 10f32.sqrt(), 2. / 10f32.sqrt()],
            [2. / 12f32.sqrt(), 0., 2. / 12f32.sqrt(), 2. / 12f32.sqrt()],
            [1. / 18f32.sqrt(), 1. / 18f32.sqrt(), 0., 4. / 18f32.sqrt()],
            [0., 0., 0., 0.],
        ];
        for (i, row) in expected.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_approx_eq!(v, repr[[i, j]]);
            }
        }
    }
}
