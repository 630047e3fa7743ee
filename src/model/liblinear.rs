use crate::{Error, Index, Result, SparseMat, SparseVecView};
use const_default::ConstDefault;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// The loss function used by liblinear model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossType {
    /// Log loss: min_w w^Tw/2 + C \sum log(1 + exp(-y_i w^Tx_i))
    Log,
    /// Squared hinge loss: min_w w^Tw/2 + C \sum max(0, 1- y_i w^Tx_i)^2
    Hinge,
}

/// Hyper-parameter settings for training liblinear model.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParam {
    pub loss_type: LossType,
    pub eps: f32,
    pub c: f32,
    /// Value of the constant feature appended to every instance; negative disables the bias.
    pub bias: f32,
    pub weight_threshold: f32,
    pub max_iter: u32,
}

impl ConstDefault for HyperParam {
    const DEFAULT: Self = Self {
        loss_type: LossType::Hinge,
        eps: 0.1,
        c: 1.,
        bias: -1.,
        weight_threshold: 0.,
        max_iter: 1000,
    };
}

impl Default for HyperParam {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A trained multi-output linear model.
#[derive(Clone, Debug)]
pub struct LinearModel {
    /// The bias feature value the model was trained with, or -1 if there is no bias term.
    pub bias: f32,
    /// Feature (plus bias row, if any) by output weight matrix in CSR format.
    pub weights: SparseMat,
}

/// Trains one independent binary classifier per target column.
pub trait LinearTrainer: Sync {
    /// Train classifiers for a 0/1 instance-by-output target matrix on an instance-by-feature
    /// matrix.
    fn train_one_vs_rest(&self, targets: &SparseMat, features: &SparseMat) -> LinearModel;
}

impl HyperParam {
    pub fn has_bias(&self) -> bool {
        self.bias > 0.
    }

    pub fn validate(&self) -> Result<()> {
        if self.eps <= 0. {
            return Err(Error::InvalidHyperParam(format!(
                "eps must be positive, but is {}",
                self.eps
            )));
        }
        if self.c <= 0. {
            return Err(Error::InvalidHyperParam(format!(
                "c must be positive, but is {}",
                self.c
            )));
        }
        if self.weight_threshold < 0. {
            return Err(Error::InvalidHyperParam(format!(
                "weight_threshold must be non-negative, but is {}",
                self.weight_threshold
            )));
        }
        if self.max_iter == 0 {
            return Err(Error::InvalidHyperParam(
                "max_iter must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Parse a liblinear-style option string, e.g. `"-s 1 -c 0.5 -e 0.01 -B 1"`.
    ///
    /// Supported flags: `-s` solver (0 or 7 for logistic regression, 1 or 2 for squared hinge),
    /// `-c` cost, `-e` tolerance, `-B` bias feature value, `-m` max iterations and `-t` weight
    /// pruning threshold. Unspecified settings keep their defaults.
    pub fn from_options(options: &str) -> Result<Self> {
        let mut hyper_param = Self::DEFAULT;
        let mut tokens = options.split_whitespace();
        while let Some(flag) = tokens.next() {
            let value = tokens.next().ok_or_else(|| {
                Error::InvalidHyperParam(format!("Missing value for option {}", flag))
            })?;
            let parse_err =
                || Error::InvalidHyperParam(format!("Invalid value {} for option {}", value, flag));
            match flag {
                "-s" => {
                    hyper_param.loss_type = match value.parse::<u32>().map_err(|_| parse_err())? {
                        0 | 7 => LossType::Log,
                        1 | 2 => LossType::Hinge,
                        _ => return Err(parse_err()),
                    }
                }
                "-c" => hyper_param.c = value.parse().map_err(|_| parse_err())?,
                "-e" => hyper_param.eps = value.parse().map_err(|_| parse_err())?,
                "-B" => hyper_param.bias = value.parse().map_err(|_| parse_err())?,
                "-m" => hyper_param.max_iter = value.parse().map_err(|_| parse_err())?,
                "-t" => hyper_param.weight_threshold = value.parse().map_err(|_| parse_err())?,
                _ => {
                    return Err(Error::InvalidHyperParam(format!(
                        "Unknown option {}",
                        flag
                    )))
                }
            }
        }
        hyper_param.validate()?;
        Ok(hyper_param)
    }

    /// Train a binary classifier and return its dense weights, with the bias weight last if the
    /// bias is enabled.
    fn train_binary(&self, features: &SparseMat, labels: &[bool], n_features: usize) -> Vec<f32> {
        assert_eq!(features.rows(), labels.len());
        let n_weights = n_features + self.has_bias() as usize;
        if labels.is_empty() {
            return vec![0.; n_weights];
        }

        let problem = Problem {
            rows: features.outer_iterator().collect(),
            n_features,
            bias: if self.has_bias() { Some(self.bias) } else { None },
        };
        let y = labels
            .iter()
            .map(|&l| if l { 1. } else { -1. })
            .collect::<Vec<f32>>();

        // Deterministic per problem so that training is reproducible
        let mut rng = StdRng::seed_from_u64(labels.len() as u64);
        match self.loss_type {
            LossType::Hinge => solve_l2r_l2loss_svc_dual(
                &problem,
                &y,
                self.eps,
                self.c,
                self.max_iter,
                &mut rng,
            ),
            LossType::Log => {
                solve_l2r_lr_dual(&problem, &y, self.eps, self.c, self.max_iter, &mut rng)
            }
        }
    }
}

/// One-vs-rest training by dual coordinate descent, following liblinear's solvers for
/// L2-regularized squared-hinge and logistic losses.
impl LinearTrainer for HyperParam {
    fn train_one_vs_rest(&self, targets: &SparseMat, features: &SparseMat) -> LinearModel {
        assert!(targets.is_csr());
        assert!(features.is_csr());
        assert_eq!(targets.rows(), features.rows());

        let n_examples = targets.rows();
        let n_outputs = targets.cols();
        let n_features = features.cols();

        let mut label_columns = vec![vec![false; n_examples]; n_outputs];
        for (i, row) in targets.outer_iterator().enumerate() {
            for (j, &v) in row.iter() {
                if v != 0. {
                    label_columns[j][i] = true;
                }
            }
        }

        let weight_columns = label_columns
            .par_iter()
            .map(|labels| {
                self.train_binary(features, labels, n_features)
                    .into_iter()
                    .enumerate()
                    .filter(|&(_, w)| w != 0. && w.abs() >= self.weight_threshold)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let n_rows = n_features + self.has_bias() as usize;
        LinearModel {
            bias: if self.has_bias() { self.bias } else { -1. },
            weights: transpose_columns_to_csr(&weight_columns, n_rows),
        }
    }
}

/// Assemble a CSR matrix from per-column lists of (row, value) pairs sorted by row.
fn transpose_columns_to_csr(columns: &[Vec<(usize, f32)>], n_rows: usize) -> SparseMat {
    let mut row_counts = vec![0usize; n_rows + 1];
    for column in columns {
        for &(i, _) in column {
            row_counts[i + 1] += 1;
        }
    }
    for i in 0..n_rows {
        row_counts[i + 1] += row_counts[i];
    }

    let nnz = row_counts[n_rows];
    let mut indices = vec![0 as Index; nnz];
    let mut data = vec![0f32; nnz];
    let mut cursors = row_counts.clone();
    // Columns are visited in order, so indices within each row come out sorted
    for (j, column) in columns.iter().enumerate() {
        for &(i, v) in column {
            let k = cursors[i];
            indices[k] = j as Index;
            data[k] = v;
            cursors[i] += 1;
        }
    }

    let indptr = row_counts.into_iter().map(|p| p as Index).collect();
    SparseMat::new((n_rows, columns.len()), indptr, indices, data)
}

struct Problem<'a> {
    rows: Vec<SparseVecView<'a>>,
    n_features: usize,
    bias: Option<f32>,
}

impl<'a> Problem<'a> {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn dot(&self, i: usize, w: &[f32]) -> f32 {
        let mut sum = 0.;
        for (j, &v) in self.rows[i].iter() {
            if j < self.n_features {
                sum += w[j] * v;
            }
        }
        if let Some(b) = self.bias {
            sum += w[self.n_features] * b;
        }
        sum
    }

    fn add_to(&self, i: usize, scale: f32, w: &mut [f32]) {
        for (j, &v) in self.rows[i].iter() {
            if j < self.n_features {
                w[j] += scale * v;
            }
        }
        if let Some(b) = self.bias {
            w[self.n_features] += scale * b;
        }
    }

    fn squared_norm(&self, i: usize) -> f32 {
        let mut sum = self
            .rows[i]
            .iter()
            .filter(|&(j, _)| j < self.n_features)
            .map(|(_, &v)| v * v)
            .sum::<f32>();
        if let Some(b) = self.bias {
            sum += b * b;
        }
        sum
    }

    fn n_weights(&self) -> usize {
        self.n_features + self.bias.is_some() as usize
    }
}

/// Dual coordinate descent for L2-regularized squared-hinge-loss SVM.
///
/// See Algorithm 3 of Hsieh et al., ICML 2008.
fn solve_l2r_l2loss_svc_dual(
    prob: &Problem,
    y: &[f32],
    eps: f32,
    c: f32,
    max_iter: u32,
    rng: &mut StdRng,
) -> Vec<f32> {
    let l = prob.len();
    let diag = 0.5 / c;
    let mut w = vec![0f32; prob.n_weights()];
    let mut alpha = vec![0f32; l];
    let qd = (0..l)
        .map(|i| diag + prob.squared_norm(i))
        .collect::<Vec<_>>();
    let mut index = (0..l).collect::<Vec<_>>();

    let mut active_size = l;
    let mut pg_max_old = f32::INFINITY;
    let mut pg_min_old = f32::NEG_INFINITY;
    for _ in 0..max_iter {
        let mut pg_max_new = f32::NEG_INFINITY;
        let mut pg_min_new = f32::INFINITY;

        index[..active_size].shuffle(rng);

        let mut s = 0;
        while s < active_size {
            let i = index[s];
            let g = y[i] * prob.dot(i, &w) - 1. + alpha[i] * diag;

            let mut pg = 0.;
            if alpha[i] == 0. {
                if g > pg_max_old {
                    // Shrink: this variable is likely to stay at its bound
                    active_size -= 1;
                    index.swap(s, active_size);
                    continue;
                } else if g < 0. {
                    pg = g;
                }
            } else {
                pg = g;
            }

            pg_max_new = pg_max_new.max(pg);
            pg_min_new = pg_min_new.min(pg);

            if pg.abs() > 1e-12 {
                let alpha_old = alpha[i];
                alpha[i] = (alpha[i] - g / qd[i]).max(0.);
                prob.add_to(i, (alpha[i] - alpha_old) * y[i], &mut w);
            }
            s += 1;
        }

        if pg_max_new - pg_min_new <= eps {
            if active_size == l {
                break;
            }
            // Re-check all variables before declaring convergence
            active_size = l;
            pg_max_old = f32::INFINITY;
            pg_min_old = f32::NEG_INFINITY;
            continue;
        }

        pg_max_old = if pg_max_new <= 0. {
            f32::INFINITY
        } else {
            pg_max_new
        };
        pg_min_old = if pg_min_new >= 0. {
            f32::NEG_INFINITY
        } else {
            pg_min_new
        };
    }

    w
}

/// Dual coordinate descent for L2-regularized logistic regression.
///
/// See Algorithm 5 of Yu et al., MLJ 2010.
fn solve_l2r_lr_dual(
    prob: &Problem,
    y: &[f32],
    eps: f32,
    c: f32,
    max_iter: u32,
    rng: &mut StdRng,
) -> Vec<f32> {
    const MAX_INNER_ITER: usize = 100;
    const ETA: f64 = 0.1;

    let l = prob.len();
    let c = f64::from(c);
    let mut w = vec![0f32; prob.n_weights()];
    let mut index = (0..l).collect::<Vec<_>>();

    // alpha[2i] and alpha[2i + 1] always sum to c
    let mut alpha = vec![0f64; 2 * l];
    let mut xtx = vec![0f64; l];
    for i in 0..l {
        alpha[2 * i] = (0.001 * c).min(1e-8);
        alpha[2 * i + 1] = c - alpha[2 * i];
        xtx[i] = f64::from(prob.squared_norm(i));
        prob.add_to(i, y[i] * alpha[2 * i] as f32, &mut w);
    }

    let eps = f64::from(eps);
    let inner_eps_min = eps.min(1e-8);
    let mut inner_eps = 1e-2;
    for _ in 0..max_iter {
        index.shuffle(rng);
        let mut newton_iter = 0;
        let mut g_max = 0f64;

        for &i in &index {
            let yi = f64::from(y[i]);
            let a = xtx[i];
            let b = yi * f64::from(prob.dot(i, &w));

            let (ind1, ind2, sign) = if 0.5 * a * (alpha[2 * i + 1] - alpha[2 * i]) + b < 0. {
                (2 * i + 1, 2 * i, -1.)
            } else {
                (2 * i, 2 * i + 1, 1.)
            };

            let alpha_old = alpha[ind1];
            let mut z = alpha_old;
            if c - z < 0.5 * c {
                z *= 0.1;
            }
            let mut gp = a * (z - alpha_old) + sign * b + (z / (c - z)).ln();
            g_max = g_max.max(gp.abs());

            let mut inner_iter = 0;
            while inner_iter <= MAX_INNER_ITER {
                if gp.abs() < inner_eps {
                    break;
                }
                let gpp = a + c / (c - z) / z;
                let tmp_z = z - gp / gpp;
                if tmp_z <= 0. {
                    z *= ETA;
                } else {
                    z = tmp_z;
                }
                gp = a * (z - alpha_old) + sign * b + (z / (c - z)).ln();
                newton_iter += 1;
                inner_iter += 1;
            }

            if inner_iter > 0 {
                alpha[ind1] = z;
                alpha[ind2] = c - z;
                prob.add_to(i, (sign * (z - alpha_old) * yi) as f32, &mut w);
            }
        }

        if g_max < eps {
            break;
        }
        if newton_iter <= l / 10 {
            inner_eps = inner_eps_min.max(0.1 * inner_eps);
        }
    }

    w
}
