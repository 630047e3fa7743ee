use crate::mat_util::CsrBlock;
use crate::mmap::{grown_capacity, ArraySpan, MappedArray};
use crate::{Index, SparseMat};
use log::debug;
use std::fs;
use std::io::Result;
use std::path::{Path, PathBuf};

/// Initial capacity, in non-zeros, of the value and column index arrays.
pub const CHUNK_SIZE: usize = 4096;

/// Where a node's weight block lives inside a [`WeightAccumulator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockView {
    pub shape: (usize, usize),
    /// Span of both the values and the column indices.
    pub nonzeros: ArraySpan,
    pub indptr: ArraySpan,
}

/// A trained node classifier whose weights have been moved into a [`WeightAccumulator`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NodeModel {
    pub bias: f32,
    pub weights: BlockView,
}

/// Streams per-node CSR weight blocks into three memory-mapped arrays, one block after another.
///
/// Values and column indices grow together by doubling. Row pointers are allocated once for
/// the worst case of every node having the same number of rows.
pub struct WeightAccumulator {
    data: MappedArray<f32>,
    indices: MappedArray<Index>,
    indptr: MappedArray<Index>,
}

impl WeightAccumulator {
    pub fn create<P: AsRef<Path>>(dir: P, n_nodes: usize, n_rows_per_block: usize) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            data: MappedArray::create(dir.join("nodes.data"), CHUNK_SIZE)?,
            indices: MappedArray::create(dir.join("nodes.indices"), CHUNK_SIZE)?,
            indptr: MappedArray::create(
                dir.join("nodes.indptr"),
                n_nodes * (n_rows_per_block + 1),
            )?,
        })
    }

    /// Move a weight matrix into the mapped arrays and return a view of where it was written.
    pub fn append(&mut self, weights: SparseMat) -> Result<BlockView> {
        assert!(weights.is_csr());
        let shape = weights.shape();
        let (indptr, indices, data) = weights.into_raw_storage();
        let nnz = data.len();

        let required = self.data.len() + nnz;
        if self.data.capacity() < required {
            let capacity = grown_capacity(required);
            self.data.resize(capacity)?;
            self.indices.resize(capacity)?;
        }

        let nonzeros = self.data.append(&data)?;
        let index_span = self.indices.append(&indices)?;
        assert_eq!(nonzeros, index_span);
        let indptr = self.indptr.append(&indptr)?;
        debug!(
            "Appended {}x{} weight block with {} non-zeros",
            shape.0, shape.1, nnz
        );

        Ok(BlockView {
            shape,
            nonzeros,
            indptr,
        })
    }

    pub fn block(&self, view: &BlockView) -> CsrBlock<'_, Index> {
        CsrBlock::new(
            view.shape,
            self.indptr.slice(view.indptr),
            self.indices.slice(view.nonzeros),
            self.data.slice(view.nonzeros),
        )
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn indptr_capacity(&self) -> usize {
        self.indptr.capacity()
    }

    fn paths(&self) -> [PathBuf; 3] {
        [
            self.data.path().to_path_buf(),
            self.indices.path().to_path_buf(),
            self.indptr.path().to_path_buf(),
        ]
    }

    /// Unmap and delete the backing files.
    pub fn remove_files(self) -> Result<()> {
        let paths = self.paths();
        drop(self);
        for path in &paths {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
