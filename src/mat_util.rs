use crate::Index;
use bit_set::BitSet;
use num_traits::{AsPrimitive, Float, Unsigned};
use sprs::{CsMatBase, CsMatI, SpIndex};
use std::ops::{AddAssign, Deref, DerefMut, DivAssign};

pub trait IndexValuePairs<IndexT: SpIndex + Unsigned, ValueT: Copy>:
    Deref<Target = [(IndexT, ValueT)]>
{
    fn is_valid_sparse_vec(&self, length: usize) -> bool {
        // If empty, always valid
        if self.is_empty() {
            return true;
        }
        // Check if:
        // - All indices are smaller than max index
        // - Pairs are sorted by indices
        // - There are no duplicate indices
        if self[0].0.index() >= length {
            return false;
        }
        if self.len() > 1 {
            for ((i, _), (j, _)) in self.iter().skip(1).zip(self.iter()) {
                if i.index() >= length || i <= j {
                    return false;
                }
            }
        }

        true
    }
}

impl<IndexT, ValueT, PairsT> IndexValuePairs<IndexT, ValueT> for PairsT
where
    IndexT: SpIndex + Unsigned,
    ValueT: Copy,
    PairsT: Deref<Target = [(IndexT, ValueT)]>,
{
}

pub trait IndexValuePairsMut<IndexT, ValueT>: DerefMut<Target = [(IndexT, ValueT)]> {
    fn sort_by_index(&mut self)
    where
        IndexT: Ord,
    {
        self.sort_unstable_by(|l, r| l.0.cmp(&r.0));
    }

    fn l2_normalize(&mut self)
    where
        ValueT: Float + AddAssign + DivAssign,
    {
        let mut length = ValueT::zero();
        for (_, v) in self.iter() {
            length += v.powi(2);
        }

        if !length.is_zero() {
            length = length.sqrt();
            for (_, v) in self.iter_mut() {
                *v /= length;
            }
        }
    }
}

impl<IndexT, ValueT, PairsT> IndexValuePairsMut<IndexT, ValueT> for PairsT where
    PairsT: DerefMut<Target = [(IndexT, ValueT)]>
{
}

pub trait IndexValuePairLists<IndexT, ValueT, RowT>: Deref<Target = [RowT]>
where
    RowT: Deref<Target = [(IndexT, ValueT)]>,
{
    /// Copy data to a new sprs CSR matrix object.
    ///
    /// This assumes that is_valid_sparse_vec would return true for each row.
    fn copy_to_csrmat(&self, n_col: usize) -> sprs::CsMatI<ValueT, IndexT>
    where
        IndexT: SpIndex,
        ValueT: Copy,
    {
        let mut indptr: Vec<IndexT> = Vec::with_capacity(self.len() + 1);
        let mut indices: Vec<IndexT> = Vec::new();
        let mut data: Vec<ValueT> = Vec::new();

        indptr.push(IndexT::zero());
        for row in self.iter() {
            for &(i, v) in row.iter() {
                assert!(i.index() < n_col);
                indices.push(i);
                data.push(v);
            }
            indptr.push(IndexT::from_usize(indices.len()));
        }

        sprs::CsMatI::new((self.len(), n_col), indptr, indices, data)
    }
}

impl<IndexT, ValueT, RowT, T> IndexValuePairLists<IndexT, ValueT, RowT> for T
where
    T: Deref<Target = [RowT]>,
    RowT: Deref<Target = [(IndexT, ValueT)]>,
{
}

pub trait CsMatBaseTools<DataT, IndexT: SpIndex>: sprs::SparseMat {
    fn copy_outer_dims(&self, indices: &[usize]) -> CsMatI<DataT, IndexT>;
    fn outer_dims_with_any_inner(&self, inner_indices: &BitSet) -> Vec<usize>;
}

impl<N, I, IptrStorage, IndStorage, DataStorage> CsMatBaseTools<N, I>
    for CsMatBase<N, I, IptrStorage, IndStorage, DataStorage>
where
    I: SpIndex,
    N: Copy,
    IptrStorage: Deref<Target = [I]>,
    IndStorage: Deref<Target = [I]>,
    DataStorage: Deref<Target = [N]>,
{
    /// Copy the given rows (outer dimensions) into a new matrix, in the given order.
    fn copy_outer_dims(&self, indices: &[usize]) -> CsMatI<N, I> {
        let mut iptr = Vec::<I>::with_capacity(indices.len() + 1);
        let mut ind = Vec::<I>::with_capacity(indices.len() * 2);
        let mut data = Vec::<N>::with_capacity(indices.len() * 2);

        iptr.push(I::zero());
        for &i in indices {
            if let Some(v) = self.outer_view(i) {
                ind.extend_from_slice(v.indices());
                data.extend_from_slice(v.data());
            }

            iptr.push(I::from_usize(ind.len()));
        }

        CsMatI::new((indices.len(), self.inner_dims()), iptr, ind, data)
    }

    /// Find the rows (outer dimensions) that have at least one non-zero in the given columns.
    fn outer_dims_with_any_inner(&self, inner_indices: &BitSet) -> Vec<usize> {
        self.outer_iterator()
            .enumerate()
            .filter_map(|(i, row)| {
                if row.indices().iter().any(|&j| inner_indices.contains(j.index())) {
                    Some(i)
                } else {
                    None
                }
            })
            .collect()
    }
}

/// A borrowed CSR block whose storage lives elsewhere, e.g. in memory-mapped arrays.
///
/// The row pointers are relative to the start of `indices` and `data`.
#[derive(Clone, Copy, Debug)]
pub struct CsrBlock<'a, P> {
    pub shape: (usize, usize),
    pub indptr: &'a [P],
    pub indices: &'a [Index],
    pub data: &'a [f32],
}

impl<'a, P> CsrBlock<'a, P>
where
    P: AsPrimitive<usize>,
{
    pub fn new(
        shape: (usize, usize),
        indptr: &'a [P],
        indices: &'a [Index],
        data: &'a [f32],
    ) -> Self {
        assert_eq!(shape.0 + 1, indptr.len());
        assert_eq!(indices.len(), data.len());
        Self {
            shape,
            indptr,
            indices,
            data,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.shape.0
    }

    pub fn n_cols(&self) -> usize {
        self.shape.1
    }

    pub fn nnz(&self) -> usize {
        self.indptr[self.shape.0].as_() - self.indptr[0].as_()
    }

    /// Column indices and values of the given row.
    #[inline]
    pub fn row(&self, i: usize) -> (&'a [Index], &'a [f32]) {
        let base = self.indptr[0].as_();
        let start = self.indptr[i].as_() - base;
        let end = self.indptr[i + 1].as_() - base;
        (&self.indices[start..end], &self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_sparse_vec() {
        assert!(Vec::<(usize, f64)>::new().is_valid_sparse_vec(0));
        assert!(Vec::<(usize, f64)>::new().is_valid_sparse_vec(123));

        assert!(vec![(123u32, 123.)].is_valid_sparse_vec(124));
        assert!(!vec![(123u32, 123.)].is_valid_sparse_vec(123));

        assert!(vec![(1u32, 0.), (3, 0.), (5, 0.)].is_valid_sparse_vec(6));
        assert!(!vec![(1u32, 0.), (3, 0.), (5, 0.)].is_valid_sparse_vec(5));
        assert!(!vec![(1u32, 0.), (5, 0.), (3, 0.)].is_valid_sparse_vec(6));
    }

    #[test]
    fn test_sort_by_index() {
        let mut pairs = vec![(1, 123.), (3, 321.), (2, 213.), (4, 432.)];
        pairs.sort_by_index();
        assert_eq!(vec![(1, 123.), (2, 213.), (3, 321.), (4, 432.)], pairs);
    }

    #[test]
    fn test_l2_normalize() {
        let mut pairs = vec![(1, 1.), (5, 2.), (50, 4.), (100, 6.), (1000, 8.)];
        pairs.l2_normalize();
        assert_eq!(
            vec![
                (1, 1. / 11.),
                (5, 2. / 11.),
                (50, 4. / 11.),
                (100, 6. / 11.),
                (1000, 8. / 11.),
            ],
            pairs
        );

        let mut pairs = vec![(1, 0.), (5, 0.)];
        pairs.l2_normalize();
        assert_eq!(vec![(1, 0.), (5, 0.)], pairs);
    }

    #[test]
    fn test_copy_to_csrmat() {
        let mat = vec![
            vec![(0usize, 1), (1, 2)],
            vec![(0, 3), (2, 4)],
            vec![(2, 5)],
        ];
        assert_eq!(
            sprs::CsMat::new(
                (3, 5),
                vec![0, 2, 4, 5],
                vec![0, 1, 0, 2, 2],
                vec![1, 2, 3, 4, 5],
            ),
            mat.copy_to_csrmat(5)
        );
    }

    #[test]
    fn test_copy_outer_dims() {
        let mat = sprs::CsMat::new(
            (3, 3),
            vec![0, 2, 4, 5],
            vec![0, 1, 0, 2, 2],
            vec![1, 2, 3, 4, 5],
        );
        assert_eq!(
            sprs::CsMat::new(
                (4, 3),
                vec![0, 2, 3, 3, 5],
                vec![0, 1, 2, 0, 2],
                vec![1, 2, 5, 3, 4],
            ),
            mat.copy_outer_dims(&[0, 2, 3, 1])
        );
    }

    #[test]
    fn test_outer_dims_with_any_inner() {
        let mat = sprs::CsMat::new(
            (4, 4),
            vec![0, 2, 3, 3, 5],
            vec![0, 1, 2, 1, 3],
            vec![1., 1., 1., 1., 1.],
        );
        let columns: BitSet = [1usize, 3].iter().cloned().collect();
        assert_eq!(vec![0, 3], mat.outer_dims_with_any_inner(&columns));
        assert!(mat.outer_dims_with_any_inner(&BitSet::new()).is_empty());
    }

    #[test]
    fn test_csr_block_rows() {
        let indptr = [3u64, 5, 5, 6];
        let indices = [0, 2, 1];
        let data = [1., 2., 3.];
        let block = CsrBlock::new((3, 4), &indptr, &indices, &data);
        assert_eq!(3, block.nnz());
        assert_eq!((&[0, 2][..], &[1., 2.][..]), block.row(0));
        assert!(block.row(1).0.is_empty());
        assert_eq!((&[1][..], &[3.][..]), block.row(2));
    }
}
