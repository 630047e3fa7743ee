pub type Index = u32;
pub type IndexValueVec = Vec<(Index, f32)>;
pub type IndexSet = hashbrown::HashSet<Index>;
pub type SparseVecView<'a> = sprs::CsVecViewI<'a, f32, Index>;
pub type SparseMat = sprs::CsMatI<f32, Index>;
pub type DenseVec = ndarray::Array1<f32>;
pub type DenseVecView<'a> = ndarray::ArrayView1<'a, f32>;
pub type DenseMat = ndarray::Array2<f32>;
pub type DataSet = data::DataSet;
pub type Model = model::TreeModel;
pub use error::{Error, Result};

pub mod data;
mod error;
pub mod mat_util;
pub mod mmap;
pub mod model;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_approx_eq;
