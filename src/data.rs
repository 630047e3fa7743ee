use crate::mat_util::*;
use crate::{Index, IndexSet, IndexValueVec, SparseMat};
use itertools::Itertools;
use log::info;
use rayon::prelude::*;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use time;

/// A multi-label dataset loaded in memory.
#[derive(Clone)]
pub struct DataSet {
    pub(crate) n_features: usize,
    pub(crate) n_labels: usize,
    pub(crate) feature_lists: Vec<IndexValueVec>,
    pub(crate) label_sets: Vec<IndexSet>,
}

/// Parse a line in a data file from the Extreme Classification Repository
///
/// The line should be in the following format:
/// label1,label2,...labelk ft1:ft1_val ft2:ft2_val ft3:ft3_val .. ftd:ftd_val
fn parse_xc_repo_data_line(
    line: &str,
    n_features: usize,
    n_labels: usize,
) -> Result<(IndexValueVec, IndexSet)> {
    let mut token_iter = line.split(' ');

    let mut labels = IndexSet::new();
    {
        let labels_str = token_iter.next().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Failed to find labels in line: \"{}\"", line),
            )
        })?;
        for label_str in labels_str.split(',') {
            if !label_str.is_empty() {
                let label = label_str.parse::<Index>().map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse label {} in line \"{}\"", label_str, line),
                    )
                })?;
                if label as usize >= n_labels {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!(
                            "Label {} is out of range, expected fewer than {} labels",
                            label, n_labels
                        ),
                    ));
                }
                labels.insert(label);
            }
        }
        labels.shrink_to_fit();
    }

    let mut features = Vec::new();
    {
        for feature_value_pair_str in token_iter.filter(|s| !s.is_empty()) {
            let mut feature_value_pair_iter = feature_value_pair_str.split(':');
            let feature = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<Index>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature {}", feature_value_pair_str),
                    )
                })?;
            let value = feature_value_pair_iter
                .next()
                .and_then(|s| s.parse::<f32>().ok())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to parse feature value {}", feature_value_pair_str),
                    )
                })?;
            if feature_value_pair_iter.next().is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Failed to parse feature {}", feature_value_pair_str),
                ));
            }
            features.push((feature, value));
        }
        features.sort_by_index();
        if !features.is_valid_sparse_vec(n_features) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Feature vector is invalid in line {}", line),
            ));
        }
    }

    Ok((features, labels))
}

fn parse_header_count(token: &str, what: &str) -> Result<usize> {
    token.parse::<usize>().map_err(|_| {
        Error::new(
            ErrorKind::InvalidData,
            format!("Failed to parse number of {}", what),
        )
    })
}

impl DataSet {
    /// Load a data file from the Extreme Classification Repository
    pub fn load_xc_repo_data_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading data from {}", path.display());
        let start_t = time::precise_time_s();

        let file_content = fs::read_to_string(path)?;
        info!("Parsing data");
        let lines: Vec<&str> = file_content
            .par_lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let header = lines
            .first()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Missing header line"))?;
        let (n_examples, n_features, n_labels) = {
            let tokens = header.split_whitespace().collect_vec();
            if tokens.len() != 3 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Expect header line with 3 space-separated tokens, found {} instead",
                        tokens.len()
                    ),
                ));
            }

            (
                parse_header_count(tokens[0], "examples")?,
                parse_header_count(tokens[1], "features")?,
                parse_header_count(tokens[2], "labels")?,
            )
        };

        let lines: Vec<_> = lines
            .into_par_iter()
            .skip(1)
            .map(|line| parse_xc_repo_data_line(line, n_features, n_labels))
            .collect::<Result<_>>()?;
        let (feature_lists, label_sets): (Vec<_>, Vec<_>) = lines.into_iter().unzip();

        if n_examples != feature_lists.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected {} examples, but read {}",
                    n_examples,
                    feature_lists.len()
                ),
            ));
        }

        info!(
            "Loaded {} examples; it took {:.2}s",
            n_examples,
            time::precise_time_s() - start_t
        );
        Ok(Self {
            n_features,
            n_labels,
            feature_lists,
            label_sets,
        })
    }

    /// Build a dataset from an example-by-label 0/1 matrix and an example-by-feature matrix.
    pub fn from_matrices(y: &SparseMat, x: &SparseMat) -> Self {
        assert!(y.is_csr());
        assert!(x.is_csr());
        assert_eq!(y.rows(), x.rows());
        let feature_lists = x
            .outer_iterator()
            .map(|row| {
                row.iter()
                    .map(|(j, &v)| (j as Index, v))
                    .collect::<IndexValueVec>()
            })
            .collect();
        let label_sets = y
            .outer_iterator()
            .map(|row| {
                row.iter()
                    .filter(|&(_, &v)| v != 0.)
                    .map(|(j, _)| j as Index)
                    .collect::<IndexSet>()
            })
            .collect();
        Self {
            n_features: x.cols(),
            n_labels: y.cols(),
            feature_lists,
            label_sets,
        }
    }

    pub fn n_examples(&self) -> usize {
        self.feature_lists.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    pub fn label_sets(&self) -> &[IndexSet] {
        &self.label_sets
    }

    /// The example-by-feature matrix.
    pub fn feature_matrix(&self) -> SparseMat {
        self.feature_lists.copy_to_csrmat(self.n_features)
    }

    /// The example-by-label matrix, with a 1 for each label an example carries.
    pub fn label_matrix(&self) -> SparseMat {
        let label_lists = self
            .label_sets
            .iter()
            .map(|labels| {
                let mut v = labels.iter().map(|&l| (l, 1.)).collect::<IndexValueVec>();
                v.sort_by_index();
                v
            })
            .collect_vec();
        label_lists.copy_to_csrmat(self.n_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::iter::FromIterator;

    #[test]
    fn test_parse_xc_repo_data_line() {
        assert_eq!(
            (
                vec![(21, 1.), (23, 2.), (24, 3.)],
                IndexSet::from_iter(vec![11, 12]),
            ),
            parse_xc_repo_data_line("11,12 21:1 23:2 24:3", 25, 13).unwrap()
        );
    }

    #[test]
    fn test_parse_xc_repo_data_line_rejects_out_of_range() {
        assert!(parse_xc_repo_data_line("11,12 21:1 23:2 24:3", 24, 13).is_err());
        assert!(parse_xc_repo_data_line("11,13 21:1", 25, 13).is_err());
        assert!(parse_xc_repo_data_line("1 2:1:3", 25, 13).is_err());
    }

    #[test]
    fn test_load_xc_repo_data_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "3 4 3").unwrap();
        writeln!(file, "0,2 0:1 3:0.5").unwrap();
        writeln!(file, " 1:2").unwrap();
        writeln!(file, "1 2:1.5").unwrap();
        file.flush().unwrap();

        let dataset = DataSet::load_xc_repo_data_file(file.path()).unwrap();
        assert_eq!(3, dataset.n_examples());
        assert_eq!(4, dataset.n_features());
        assert_eq!(3, dataset.n_labels());

        let x = dataset.feature_matrix();
        assert_eq!((3, 4), x.shape());
        assert_eq!(
            vec![
                vec![1., 0., 0., 0.5],
                vec![0., 2., 0., 0.],
                vec![0., 0., 1.5, 0.],
            ],
            x.to_dense().outer_iter().map(|r| r.to_vec()).collect_vec()
        );

        let y = dataset.label_matrix();
        assert_eq!((3, 3), y.shape());
        assert_eq!(&[0, 2][..], y.outer_view(0).unwrap().indices());
        assert_eq!(0, y.outer_view(1).unwrap().nnz());
        assert_eq!(&[1][..], y.outer_view(2).unwrap().indices());

        let copy = DataSet::from_matrices(&y, &x);
        assert_eq!(dataset.label_sets(), copy.label_sets());
        assert_eq!(dataset.feature_lists, copy.feature_lists);
    }

    #[test]
    fn test_load_xc_repo_data_file_rejects_wrong_example_count() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "2 4 3").unwrap();
        writeln!(file, "0 0:1").unwrap();
        file.flush().unwrap();

        let err = DataSet::load_xc_repo_data_file(file.path())
            .err()
            .expect("Loading should fail");
        assert_eq!(ErrorKind::InvalidData, err.kind());
    }
}
