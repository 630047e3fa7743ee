use crate::mat_util::*;
use crate::util::create_progress_bar;
use crate::{DataSet, Index, IndexValueVec, Model};
use hashbrown::HashSet;
use itertools::izip;
use log::info;

/// Number of test examples scored per forward pass.
const BATCH_SIZE: usize = 1024;

/// Compute precision@1 through precision@max_k, averaged over examples.
pub fn precision_at_k(
    max_k: usize,
    true_labels: &[HashSet<Index>],
    predicted_labels: &[IndexValueVec],
) -> Vec<f32> {
    assert_eq!(true_labels.len(), predicted_labels.len());
    let mut ps = vec![0.; max_k];
    if predicted_labels.is_empty() {
        return ps;
    }
    for (truth, predictions) in izip!(true_labels, predicted_labels) {
        let mut n_correct = 0;
        for k in 0..max_k {
            if k < predictions.len() && truth.contains(&predictions[k].0) {
                n_correct += 1;
            }
            ps[k] += n_correct as f32 / (k + 1) as f32;
        }
    }
    for p in &mut ps {
        *p /= predicted_labels.len() as f32;
    }
    ps
}

/// Predict the top `k_top` labels of every test example and report precision@[1, 3, 5].
///
/// Examples with fewer than 5 predicted labels count the missing ones as misses.
pub fn test_all(
    model: &Model,
    test_dataset: &DataSet,
    beam_width: usize,
    k_top: usize,
) -> (Vec<IndexValueVec>, Vec<f32>) {
    let n_examples = test_dataset.n_examples();
    let x = test_dataset.feature_matrix();
    let mut pb = create_progress_bar(n_examples as u64);
    let start_t = time::precise_time_s();

    let mut predicted_labels = Vec::with_capacity(n_examples);
    let indices = (0..n_examples).collect::<Vec<_>>();
    for batch in indices.chunks(BATCH_SIZE) {
        let batch_x = x.copy_outer_dims(batch);
        predicted_labels.extend(model.predict_top_k(&batch_x, beam_width, k_top));
        pb.add(batch.len() as u64);
    }
    pb.finish();
    info!(
        "Done testing on {} examples; it took {:.2}s",
        n_examples,
        time::precise_time_s() - start_t
    );

    let precisions = precision_at_k(5, test_dataset.label_sets(), &predicted_labels);
    info!(
        "Precision@[1, 3, 5] = [{:.2}, {:.2}, {:.2}]",
        precisions[0] * 100.,
        precisions[2] * 100.,
        precisions[4] * 100.,
    );

    (predicted_labels, precisions)
}
