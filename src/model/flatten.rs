use super::tree::Tree;
use super::weights::{NodeModel, WeightAccumulator};
use crate::mat_util::CsrBlock;
use crate::mmap::MappedArray;
use crate::{Error, Index, Result};
use itertools::Itertools;
use log::info;
use num_traits::AsPrimitive;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// A CSR matrix whose values, column indices and row pointers live in memory-mapped files.
pub struct MappedCsr {
    shape: (usize, usize),
    data: MappedArray<f32>,
    indices: MappedArray<Index>,
    indptr: MappedArray<u64>,
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

impl MappedCsr {
    fn create(prefix: &Path, shape: (usize, usize), nnz: usize) -> io::Result<Self> {
        Ok(Self {
            shape,
            data: MappedArray::create(with_suffix(prefix, ".data"), nnz)?,
            indices: MappedArray::create(with_suffix(prefix, ".indices"), nnz)?,
            indptr: MappedArray::create(with_suffix(prefix, ".indptr"), shape.0 + 1)?,
        })
    }

    /// Re-open a matrix previously written with the given prefix, mapping its files read-only.
    pub fn open(prefix: &Path, shape: (usize, usize), nnz: usize) -> io::Result<Self> {
        let mat = Self {
            shape,
            data: MappedArray::open_read_only(with_suffix(prefix, ".data"), nnz)?,
            indices: MappedArray::open_read_only(with_suffix(prefix, ".indices"), nnz)?,
            indptr: MappedArray::open_read_only(with_suffix(prefix, ".indptr"), shape.0 + 1)?,
        };
        let indptr = mat.indptr.as_slice();
        if indptr[0] != 0 || indptr[shape.0] != nnz as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Row pointers of {} do not match {} non-zeros",
                    prefix.display(),
                    nnz
                ),
            ));
        }
        Ok(mat)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn as_block(&self) -> CsrBlock<'_, u64> {
        CsrBlock::new(
            self.shape,
            self.indptr.as_slice(),
            self.indices.as_slice(),
            self.data.as_slice(),
        )
    }

    pub fn flush(&self) -> io::Result<()> {
        self.data.flush()?;
        self.indices.flush()?;
        self.indptr.flush()
    }
}

/// Concatenate blocks column-wise into a new memory-mapped matrix.
///
/// All blocks must have the same number of rows. Each output row holds the entries of that row
/// from every block in order, with column indices shifted by the widths of the blocks before it.
pub fn hstack_to_mmap<P>(blocks: &[CsrBlock<P>], prefix: &Path) -> Result<MappedCsr>
where
    P: AsPrimitive<usize>,
{
    let n_rows = blocks.first().map_or(0, |b| b.n_rows());
    for (i, block) in blocks.iter().enumerate() {
        if block.n_rows() != n_rows {
            return Err(Error::DimensionMismatch {
                block: i,
                expected: n_rows,
                found: block.n_rows(),
            });
        }
    }

    let col_offsets = blocks
        .iter()
        .scan(0, |offset, block| {
            let start = *offset;
            *offset += block.n_cols();
            Some(start)
        })
        .collect_vec();
    let n_cols = blocks.iter().map(|b| b.n_cols()).sum::<usize>();
    let nnz = blocks.iter().map(|b| b.nnz()).sum::<usize>();
    assert!(n_cols <= Index::MAX as usize);

    let mut mat = MappedCsr::create(prefix, (n_rows, n_cols), nnz)?;
    mat.indptr.append(&[0])?;
    for i in 0..n_rows {
        for (block, &offset) in blocks.iter().zip(col_offsets.iter()) {
            let (indices, data) = block.row(i);
            mat.indices
                .extend(indices.iter().map(|&j| j + offset as Index))?;
            mat.data.append(data)?;
        }
        mat.indptr.append(&[mat.data.len() as u64])?;
    }
    assert_eq!(nnz, mat.nnz());
    mat.flush()?;
    Ok(mat)
}

/// The classifiers of every tree node merged into one weight matrix.
pub struct FlatModel {
    pub weights: MappedCsr,
    pub bias: f32,
}

/// Merge the weight blocks of all nodes, in arena order, into one matrix.
///
/// Returns the merged model and the offsets of each node's columns: node `i` owns columns
/// `weight_map[i]..weight_map[i + 1]`.
///
/// Panics if the nodes were not all trained with the same bias, which means the tree was not
/// trained consistently.
pub fn flatten(
    tree: &Tree,
    node_models: &[NodeModel],
    accumulator: &WeightAccumulator,
    prefix: &Path,
) -> Result<(FlatModel, Vec<usize>)> {
    assert_eq!(tree.len(), node_models.len());
    let bias = node_models.first().map_or(-1., |m| m.bias);
    for (i, model) in node_models.iter().enumerate() {
        assert!(
            model.bias == bias,
            "Node {} has bias {}, but the root has bias {}",
            i,
            model.bias,
            bias
        );
    }

    let blocks = node_models
        .iter()
        .map(|m| accumulator.block(&m.weights))
        .collect_vec();
    let weights = hstack_to_mmap(&blocks, prefix)?;

    let mut weight_map = Vec::with_capacity(blocks.len() + 1);
    weight_map.push(0);
    for block in &blocks {
        weight_map.push(weight_map[weight_map.len() - 1] + block.n_cols());
    }
    info!(
        "Flattened {} nodes into a {}x{} matrix with {} non-zeros",
        tree.len(),
        weights.shape().0,
        weights.shape().1,
        weights.nnz()
    );

    Ok((FlatModel { weights, bias }, weight_map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tree::TreeNode;
    use crate::SparseMat;

    fn dense(block: &CsrBlock<u64>) -> Vec<Vec<f32>> {
        let mut rows = vec![vec![0.; block.n_cols()]; block.n_rows()];
        for (i, row) in rows.iter_mut().enumerate() {
            let (indices, data) = block.row(i);
            for (&j, &v) in indices.iter().zip(data.iter()) {
                row[j as usize] = v;
            }
        }
        rows
    }

    #[test]
    fn test_hstack_to_mmap() {
        let dir = tempfile::tempdir().unwrap();
        let a = ([0u32, 1, 1, 3], [1, 0, 1], [1., 2., 3.]);
        let b = ([0u32, 2, 2, 3], [0, 2, 1], [4., 5., 6.]);
        let blocks = [
            CsrBlock::new((3, 2), &a.0, &a.1, &a.2),
            CsrBlock::new((3, 3), &b.0, &b.1, &b.2),
        ];
        let mat = hstack_to_mmap(&blocks, &dir.path().join("flat")).unwrap();
        assert_eq!((3, 5), mat.shape());
        assert_eq!(6, mat.nnz());
        assert_eq!(
            vec![
                vec![0., 1., 4., 0., 5.],
                vec![0., 0., 0., 0., 0.],
                vec![2., 3., 0., 6., 0.],
            ],
            dense(&mat.as_block())
        );
        assert!(dir.path().join("flat.data").is_file());
        assert!(dir.path().join("flat.indices").is_file());
        assert!(dir.path().join("flat.indptr").is_file());

        let reopened = MappedCsr::open(&dir.path().join("flat"), (3, 5), 6).unwrap();
        assert_eq!(dense(&mat.as_block()), dense(&reopened.as_block()));
    }

    #[test]
    fn test_hstack_to_mmap_rejects_mismatched_rows() {
        let dir = tempfile::tempdir().unwrap();
        let a = ([0u32, 1, 1], [0], [1.]);
        let b = ([0u32, 1], [0], [2.]);
        let blocks = [
            CsrBlock::new((2, 1), &a.0, &a.1, &a.2),
            CsrBlock::new((1, 1), &b.0, &b.1, &b.2),
        ];
        match hstack_to_mmap(&blocks, &dir.path().join("flat")) {
            Err(Error::DimensionMismatch {
                block,
                expected,
                found,
            }) => assert_eq!((1, 2, 1), (block, expected, found)),
            _ => panic!("Expected a dimension mismatch"),
        }
    }

    #[test]
    fn test_hstack_to_mmap_without_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mat = hstack_to_mmap::<u32>(&[], &dir.path().join("flat")).unwrap();
        assert_eq!((0, 0), mat.shape());
        assert_eq!(0, mat.nnz());
    }

    fn small_tree() -> Tree {
        Tree::from_shape(&TreeNode::Internal {
            label_map: vec![0, 1, 2],
            children: vec![
                TreeNode::Leaf {
                    label_map: vec![0, 2],
                },
                TreeNode::Leaf { label_map: vec![1] },
            ],
        })
    }

    fn train_blocks(acc: &mut WeightAccumulator, biases: [f32; 3]) -> Vec<NodeModel> {
        let blocks = [
            SparseMat::new((2, 2), vec![0, 1, 2], vec![0, 1], vec![1., 2.]),
            SparseMat::new((2, 2), vec![0, 0, 2], vec![0, 1], vec![3., 4.]),
            SparseMat::new((2, 1), vec![0, 1, 1], vec![0], vec![5.]),
        ];
        blocks
            .iter()
            .zip(biases.iter())
            .map(|(w, &bias)| NodeModel {
                bias,
                weights: acc.append(w.clone()).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_flatten() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree();
        let mut acc = WeightAccumulator::create(dir.path(), tree.len(), 2).unwrap();
        let models = train_blocks(&mut acc, [1., 1., 1.]);

        let (flat, weight_map) =
            flatten(&tree, &models, &acc, &dir.path().join("flat_model")).unwrap();
        assert_eq!(vec![0, 2, 4, 5], weight_map);
        assert_approx_eq!(1., flat.bias);
        assert_eq!((2, 5), flat.weights.shape());
        assert_eq!(
            vec![vec![1., 0., 0., 0., 5.], vec![0., 2., 3., 4., 0.]],
            dense(&flat.weights.as_block())
        );
    }

    #[test]
    #[should_panic(expected = "has bias")]
    fn test_flatten_rejects_inconsistent_bias() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree();
        let mut acc = WeightAccumulator::create(dir.path(), tree.len(), 2).unwrap();
        let models = train_blocks(&mut acc, [1., 1., -1.]);
        let _ = flatten(&tree, &models, &acc, &dir.path().join("flat_model"));
    }
}
