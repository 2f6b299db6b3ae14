// Loss — Training objectives as blocks
//
// A loss compares a prediction with a label and returns one value per
// sample, so its output has shape [batch]. Reduce it (sum_all, mean_all)
// or hand it to backward directly.
//
//   L1Loss                    |pred - label|                 * weight
//   L2Loss                    (pred - label)²                * weight / 2
//   SoftmaxCrossEntropyLoss   -log_softmax(pred)[label]      * weight
//                             -Σ label * log_softmax(pred)   (dense labels)
//
// The per-element loss is then multiplied by the optional sample weight and
// averaged over every axis except batch_axis. Labels are reshaped to the
// prediction's shape first, so they only need the same element count.
//
// SAMPLE WEIGHTS:
//
// A sample weight has the rank of the per-element loss and broadcasts along
// its size-1 axes. For a [64, 10] L2 loss, a [64, 1] weight scales each
// sample; for softmax cross-entropy the loss is [batch, 1].

use gluon_core::{Error, NDArray, Result, Shape};

use crate::block::{Block, BlockCore};
use crate::symbol::Symbol;

/// Settings shared by every loss.
#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    /// Global scalar weight. `None` leaves the loss unscaled.
    pub weight: Option<f64>,
    /// The axis that indexes samples in the mini-batch.
    pub batch_axis: usize,
    pub prefix: Option<String>,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            weight: Some(1.0),
            batch_axis: 0,
            prefix: None,
        }
    }
}

impl LossConfig {
    pub fn with_weight(mut self, weight: impl Into<Option<f64>>) -> Self {
        self.weight = weight.into();
        self
    }

    pub fn with_batch_axis(mut self, batch_axis: usize) -> Self {
        self.batch_axis = batch_axis;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// A block that scores a prediction against a label.
pub trait Loss: Block {
    fn loss_config(&self) -> &LossConfig;

    /// The unweighted loss of every element, before averaging.
    fn elementwise(&self, prediction: &NDArray, label: &NDArray) -> Result<NDArray>;

    /// The scalar applied to every element.
    fn scale(&self) -> Option<f64> {
        self.loss_config().weight
    }

    /// Number of label elements expected for a prediction of `shape`.
    fn label_len(&self, shape: &Shape) -> usize {
        shape.elem_count()
    }

    /// Per-sample loss, shape `[batch]`.
    fn loss(&self, prediction: &NDArray, label: &NDArray) -> Result<NDArray> {
        self.loss_weighted(prediction, label, None)
    }

    fn loss_weighted(&self, prediction: &NDArray, label: &NDArray, sample_weight: Option<&NDArray>) -> Result<NDArray> {
        let mut loss = self.elementwise(prediction, label)?;
        if let Some(w) = self.scale() {
            loss = loss.affine(w, 0.0)?;
        }
        if let Some(sw) = sample_weight {
            loss = loss.broadcast_mul(sw)?;
        }
        loss.mean_except(self.loss_config().batch_axis)
    }

    /// Shape propagation: the output symbol has shape `[batch]`.
    fn infer_loss_shape(&self, prediction: &Symbol, label: &Symbol) -> Result<Symbol> {
        let shape = prediction.known_shape()?;
        let axis = self.loss_config().batch_axis;
        let batch = shape.dims().get(axis).copied().ok_or_else(|| {
            Error::invalid_shape(self.name(), format!("batch_axis {axis} is out of range for prediction {shape}"))
        })?;
        if let Some(label_shape) = label.shape() {
            let expected = self.label_len(shape);
            if label_shape.elem_count() != expected {
                return Err(Error::ElementCountMismatch {
                    shape: label_shape.clone(),
                    expected,
                    got: label_shape.elem_count(),
                });
            }
        }
        Ok(Symbol::var(format!("{}fwd", self.prefix()))
            .with_shape(batch)
            .with_dtype(prediction.dtype()))
    }
}

macro_rules! loss_block {
    ($ty:ident, $describe:expr) => {
        impl Block for $ty {
            fn core(&self) -> &BlockCore {
                &self.core
            }

            fn core_mut(&mut self) -> &mut BlockCore {
                &mut self.core
            }

            fn forward(&self, _x: &NDArray) -> Result<NDArray> {
                Err(Error::InvalidArgument(format!(
                    "'{}' takes a prediction and a label; call Loss::loss instead of forward",
                    self.name()
                )))
            }

            fn describe(&self) -> String {
                $describe(self)
            }
        }
    };
}

fn reshape_label(label: &NDArray, prediction: &NDArray) -> Result<NDArray> {
    if label.shape() == prediction.shape() {
        return Ok(label.clone());
    }
    label.reshape(prediction.shape().clone())
}

/// Mean absolute error.
pub struct L1Loss {
    core: BlockCore,
    config: LossConfig,
}

impl L1Loss {
    pub fn new(config: LossConfig) -> Self {
        L1Loss {
            core: BlockCore::new(config.prefix.as_deref(), None, "l1loss"),
            config,
        }
    }
}

loss_block!(L1Loss, |_: &L1Loss| "L1Loss".to_string());

impl Loss for L1Loss {
    fn loss_config(&self) -> &LossConfig {
        &self.config
    }

    fn elementwise(&self, prediction: &NDArray, label: &NDArray) -> Result<NDArray> {
        prediction.sub(&reshape_label(label, prediction)?)?.abs()
    }
}

/// Half the mean squared error.
pub struct L2Loss {
    core: BlockCore,
    config: LossConfig,
}

impl L2Loss {
    pub fn new(config: LossConfig) -> Self {
        L2Loss {
            core: BlockCore::new(config.prefix.as_deref(), None, "l2loss"),
            config,
        }
    }
}

loss_block!(L2Loss, |_: &L2Loss| "L2Loss".to_string());

impl Loss for L2Loss {
    fn loss_config(&self) -> &LossConfig {
        &self.config
    }

    fn elementwise(&self, prediction: &NDArray, label: &NDArray) -> Result<NDArray> {
        prediction.sub(&reshape_label(label, prediction)?)?.square()
    }

    fn scale(&self) -> Option<f64> {
        self.config.weight.map(|w| w / 2.0)
    }
}

/// Softmax followed by cross-entropy, over the last axis.
///
/// With `sparse_label` (the default) the label holds one class id per
/// row; otherwise it is a distribution with the prediction's shape. With
/// `from_logits` the prediction is taken to be log-probabilities already.
pub struct SoftmaxCrossEntropyLoss {
    core: BlockCore,
    config: LossConfig,
    sparse_label: bool,
    from_logits: bool,
}

impl SoftmaxCrossEntropyLoss {
    pub fn new(config: LossConfig) -> Self {
        SoftmaxCrossEntropyLoss {
            core: BlockCore::new(config.prefix.as_deref(), None, "softmaxcrossentropyloss"),
            config,
            sparse_label: true,
            from_logits: false,
        }
    }

    pub fn with_sparse_label(mut self, sparse_label: bool) -> Self {
        self.sparse_label = sparse_label;
        self
    }

    pub fn with_from_logits(mut self, from_logits: bool) -> Self {
        self.from_logits = from_logits;
        self
    }

    pub fn sparse_label(&self) -> bool {
        self.sparse_label
    }

    pub fn from_logits(&self) -> bool {
        self.from_logits
    }
}

loss_block!(SoftmaxCrossEntropyLoss, |l: &SoftmaxCrossEntropyLoss| format!(
    "SoftmaxCrossEntropyLoss(sparse_label={}, from_logits={})",
    l.sparse_label, l.from_logits
));

impl Loss for SoftmaxCrossEntropyLoss {
    fn loss_config(&self) -> &LossConfig {
        &self.config
    }

    fn elementwise(&self, prediction: &NDArray, label: &NDArray) -> Result<NDArray> {
        let log_prob = if self.from_logits {
            prediction.clone()
        } else {
            prediction.log_softmax()?
        };
        let picked = if self.sparse_label {
            log_prob.pick(label)?
        } else {
            log_prob.mul(&reshape_label(label, prediction)?)?.sum_last_axis()?
        };
        picked.affine(-1.0, 0.0)
    }

    fn label_len(&self, shape: &Shape) -> usize {
        match (self.sparse_label, shape.dims().last()) {
            (true, Some(&classes)) if classes > 0 => shape.elem_count() / classes,
            _ => shape.elem_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gluon_core::{Context, DType};

    fn array(values: &[f64], shape: impl Into<Shape>) -> NDArray {
        NDArray::from_f64_slice(values, shape, DType::F64, Context::cpu(0)).unwrap()
    }

    #[test]
    fn test_l1_loss_per_sample() {
        let l1 = L1Loss::new(LossConfig::default());
        let pred = array(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        // Flat labels are reshaped to the prediction.
        let label = array(&[0.0, 2.0, 5.0, 4.0], 4);
        assert_eq!(l1.loss(&pred, &label).unwrap().to_f64_vec().unwrap(), vec![0.5, 1.0]);
    }

    #[test]
    fn test_l2_loss_halves_weight() {
        let l2 = L2Loss::new(LossConfig::default().with_weight(2.0));
        let pred = array(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let label = array(&[0.0, 2.0, 5.0, 4.0], (2, 2));
        assert_eq!(l2.loss(&pred, &label).unwrap().to_f64_vec().unwrap(), vec![0.5, 2.0]);
    }

    #[test]
    fn test_sample_weight_broadcasts() {
        let l1 = L1Loss::new(LossConfig::default().with_weight(None));
        let pred = array(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let label = array(&[0.0; 4], (2, 2));
        let sw = array(&[2.0, 0.0], (2, 1));
        let out = l1.loss_weighted(&pred, &label, Some(&sw)).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn test_softmax_cross_entropy_sparse_and_dense_agree() {
        let logits = array(&[0.0, 0.0, 0.0, 3f64.ln()], (2, 2));
        let sparse = SoftmaxCrossEntropyLoss::new(LossConfig::default());
        let out = sparse.loss(&logits, &array(&[0.0, 1.0], 2)).unwrap().to_f64_vec().unwrap();
        assert_relative_eq!(out[0], 2f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(out[1], (4.0f64 / 3.0).ln(), epsilon = 1e-12);

        let dense = SoftmaxCrossEntropyLoss::new(LossConfig::default()).with_sparse_label(false);
        let one_hot = array(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let dense_out = dense.loss(&logits, &one_hot).unwrap().to_f64_vec().unwrap();
        for (a, b) in out.iter().zip(&dense_out) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_from_logits_skips_softmax() {
        let loss = SoftmaxCrossEntropyLoss::new(LossConfig::default()).with_from_logits(true);
        let log_prob = array(&[-0.25, -1.5], (1, 2));
        let out = loss.loss(&log_prob, &array(&[1.0], 1)).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![1.5]);
    }

    #[test]
    fn test_bad_class_id_is_error() {
        let loss = SoftmaxCrossEntropyLoss::new(LossConfig::default());
        let logits = array(&[0.0, 0.0], (1, 2));
        assert!(matches!(
            loss.loss(&logits, &array(&[2.0], 1)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_symbolic_output_shape() {
        let loss = SoftmaxCrossEntropyLoss::new(LossConfig::default().with_prefix("ce_"));
        let pred = Symbol::var("pred").with_shape((5, 3));
        let out = loss.infer_loss_shape(&pred, &Symbol::var("label").with_shape(5)).unwrap();
        assert_eq!(out.shape(), Some(&Shape::from(5)));
        assert_eq!(out.name(), "ce_fwd");

        assert!(loss
            .infer_loss_shape(&pred, &Symbol::var("label").with_shape((5, 3)))
            .is_err());
        let l1 = L1Loss::new(LossConfig::default().with_batch_axis(2));
        assert!(matches!(
            l1.infer_loss_shape(&pred, &Symbol::var("label")),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_forward_points_to_loss() {
        let l2 = L2Loss::new(LossConfig::default().with_prefix("l2_"));
        let err = l2.forward(&array(&[1.0], 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(ref m) if m.contains("Loss::loss")));
        assert_eq!(l2.name(), "l2");
        assert_eq!(l2.describe(), "L2Loss");
    }
}
