// Autograd — Recording scopes and the reverse pass
//
// Two flags decide what array operations do:
//
//   is_recording — operations build a differentiable trace (Op graph)
//   is_training  — layers with train/predict behavior use the train branch
//
// Both start false and are thread-local. They are only changed through
// scopes that restore the *previous* values when they end, so nesting
// composes:
//
//   record(true, || {              // recording=true,  training=true
//       pause(false, || { ... });  // recording=false, training=false
//       // back to recording=true, training=true
//   });
//   // back to whatever was set before
//
// Restoration happens in `RecordingScope::drop`, which runs on normal
// return, on `?` early return, and while unwinding from a panic.
//
// The reverse pass (`backward`) topologically sorts the recorded graph
// from the heads, applies the chain rule in f64, and writes the result into
// the gradient buffers attached with `mark_variables`.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::bail;
use crate::error::{Error, Result};
use crate::ndarray::{broadcast_map, last_axis, matmul_f64, split_axis, unary_forward, GradSlot, NDArray};
use crate::op::{ArrayId, BinaryOp, Op, UnaryOp};

#[derive(Clone, Copy)]
struct RecordingState {
    recording: bool,
    training: bool,
}

thread_local! {
    static STATE: Cell<RecordingState> = const {
        Cell::new(RecordingState { recording: false, training: false })
    };
}

/// Whether operations are currently being traced for differentiation.
pub fn is_recording() -> bool {
    STATE.with(|s| s.get().recording)
}

/// Whether layers should use their training behavior.
pub fn is_training() -> bool {
    STATE.with(|s| s.get().training)
}

/// Set the recording flag, returning the previous value.
///
/// Prefer the scoped helpers; a bare call is never undone automatically.
pub fn set_recording(recording: bool) -> bool {
    STATE.with(|s| {
        let mut st = s.get();
        let prev = std::mem::replace(&mut st.recording, recording);
        s.set(st);
        prev
    })
}

/// Set the training flag, returning the previous value.
pub fn set_training(training: bool) -> bool {
    STATE.with(|s| {
        let mut st = s.get();
        let prev = std::mem::replace(&mut st.training, training);
        s.set(st);
        prev
    })
}

/// Guard for a region with overridden recording/training flags.
///
/// `None` leaves a flag as it is. Dropping the guard restores the values that
/// were in effect when it was created.
#[must_use = "the previous autograd state is restored as soon as the scope is dropped"]
pub struct RecordingScope {
    prev_recording: Option<bool>,
    prev_training: Option<bool>,
    // the flags are thread-local; the guard must be dropped on the same thread
    _not_send: PhantomData<*const ()>,
}

impl RecordingScope {
    pub fn new(recording: Option<bool>, training: Option<bool>) -> Self {
        RecordingScope {
            prev_recording: recording.map(set_recording),
            prev_training: training.map(set_training),
            _not_send: PhantomData,
        }
    }

    /// Recording on, training set to `train_mode`.
    pub fn record(train_mode: bool) -> Self {
        Self::new(Some(true), Some(train_mode))
    }

    /// Recording off, training set to `train_mode`.
    pub fn pause(train_mode: bool) -> Self {
        Self::new(Some(false), Some(train_mode))
    }

    /// Training on, recording untouched.
    pub fn train_mode() -> Self {
        Self::new(None, Some(true))
    }

    /// Training off, recording untouched.
    pub fn predict_mode() -> Self {
        Self::new(None, Some(false))
    }
}

impl Drop for RecordingScope {
    fn drop(&mut self) {
        if let Some(r) = self.prev_recording {
            set_recording(r);
        }
        if let Some(t) = self.prev_training {
            set_training(t);
        }
    }
}

/// Run `f` with recording enabled.
pub fn record<R>(train_mode: bool, f: impl FnOnce() -> R) -> R {
    let _scope = RecordingScope::record(train_mode);
    f()
}

/// Run `f` with recording disabled.
pub fn pause<R>(train_mode: bool, f: impl FnOnce() -> R) -> R {
    let _scope = RecordingScope::pause(train_mode);
    f()
}

/// Run `f` in training mode without touching the recording flag.
pub fn train_mode<R>(f: impl FnOnce() -> R) -> R {
    let _scope = RecordingScope::train_mode();
    f()
}

/// Run `f` in prediction mode without touching the recording flag.
pub fn predict_mode<R>(f: impl FnOnce() -> R) -> R {
    let _scope = RecordingScope::predict_mode();
    f()
}

// GradReq

/// How backward treats a variable's gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GradReq {
    /// Overwrite the buffer on every backward pass.
    #[default]
    Write,
    /// Accumulate into the buffer; the caller zeroes it.
    Add,
    /// No buffer; the array is not differentiated.
    Null,
}

impl GradReq {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradReq::Write => "write",
            GradReq::Add => "add",
            GradReq::Null => "null",
        }
    }
}

impl fmt::Display for GradReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GradReq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(GradReq::Write),
            "add" => Ok(GradReq::Add),
            "null" => Ok(GradReq::Null),
            _ => Err(Error::InvalidArgument(format!(
                "grad_req must be one of 'write', 'add', or 'null', but got '{s}'"
            ))),
        }
    }
}

// Variables

/// Attach gradient buffers to variables.
///
/// After this, `backward` writes (or accumulates, per `reqs`) the gradient of
/// each variable into the corresponding buffer. `GradReq::Null` detaches.
pub fn mark_variables(variables: &[NDArray], gradients: &[NDArray], reqs: &[GradReq]) -> Result<()> {
    if variables.len() != gradients.len() || variables.len() != reqs.len() {
        return Err(Error::InvalidArgument(format!(
            "mark_variables needs one gradient and one grad_req per variable, got {} variables, {} gradients, {} grad_reqs",
            variables.len(),
            gradients.len(),
            reqs.len()
        )));
    }
    for ((var, grad), &req) in variables.iter().zip(gradients).zip(reqs) {
        if var.shape() != grad.shape() {
            return Err(Error::ShapeMismatch {
                expected: var.shape().clone(),
                got: grad.shape().clone(),
            });
        }
        if req == GradReq::Null {
            var.set_grad_slot(None);
            continue;
        }
        var.set_grad_slot(Some(GradSlot {
            buffer: grad.clone(),
            req,
        }));
        var.set_fresh_grad(false);
    }
    Ok(())
}

/// Remove gradient attachments from `variables`.
pub fn unmark_variables(variables: &[NDArray]) {
    for var in variables {
        var.set_grad_slot(None);
        var.set_fresh_grad(false);
    }
}

// Backward

/// Build a topological ordering of the graph reachable from `heads`:
/// every array appears after all of its inputs.
fn build_topo(heads: &[NDArray]) -> Vec<NDArray> {
    fn visit(a: &NDArray, visited: &mut HashSet<ArrayId>, order: &mut Vec<NDArray>) {
        if !visited.insert(a.id()) {
            return;
        }
        for input in a.op().inputs() {
            visit(input, visited, order);
        }
        order.push(a.clone());
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for h in heads {
        visit(h, &mut visited, &mut order);
    }
    order
}

fn accumulate(grads: &mut HashMap<ArrayId, Vec<f64>>, target: &NDArray, g: Vec<f64>) {
    if !target.requires_grad() {
        return;
    }
    match grads.get_mut(&target.id()) {
        Some(existing) => existing.iter_mut().zip(g).for_each(|(e, v)| *e += v),
        None => {
            grads.insert(target.id(), g);
        }
    }
}

fn transpose(a: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; a.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = a[r * cols + c];
        }
    }
    out
}

fn propagate(node: &NDArray, g: &[f64], grads: &mut HashMap<ArrayId, Vec<f64>>) -> Result<()> {
    match node.op() {
        Op::None => {}

        Op::Binary { lhs, rhs, op } => match op {
            BinaryOp::Add => {
                accumulate(grads, lhs, g.to_vec());
                accumulate(grads, rhs, g.to_vec());
            }
            BinaryOp::Sub => {
                accumulate(grads, lhs, g.to_vec());
                accumulate(grads, rhs, g.iter().map(|v| -v).collect());
            }
            BinaryOp::Mul => {
                let a = lhs.to_f64_vec()?;
                let b = rhs.to_f64_vec()?;
                accumulate(grads, lhs, g.iter().zip(&b).map(|(g, b)| g * b).collect());
                accumulate(grads, rhs, g.iter().zip(&a).map(|(g, a)| g * a).collect());
            }
        },

        Op::Unary { input, op } => {
            let x = input.to_f64_vec()?;
            let dx = x
                .iter()
                .zip(g)
                .map(|(&x, &g)| {
                    g * match op {
                        UnaryOp::Relu => {
                            if x > 0.0 {
                                1.0
                            } else {
                                0.0
                            }
                        }
                        UnaryOp::Sigmoid => {
                            let s = unary_forward(UnaryOp::Sigmoid, x);
                            s * (1.0 - s)
                        }
                        UnaryOp::Tanh => 1.0 - x.tanh().powi(2),
                        UnaryOp::Square => 2.0 * x,
                        UnaryOp::Exp => x.exp(),
                        UnaryOp::Abs => {
                            if x == 0.0 {
                                0.0
                            } else {
                                x.signum()
                            }
                        }
                    }
                })
                .collect();
            accumulate(grads, input, dx);
        }

        Op::Affine { input, mul, .. } => {
            accumulate(grads, input, g.iter().map(|v| v * mul).collect());
        }

        Op::Matmul { lhs, rhs } => {
            // C[m,n] = A[m,k] · B[k,n]
            let (m, k) = (lhs.dims()[0], lhs.dims()[1]);
            let n = rhs.dims()[1];
            let a = lhs.to_f64_vec()?;
            let b = rhs.to_f64_vec()?;
            // dA = dC · Bᵀ, dB = Aᵀ · dC
            accumulate(grads, lhs, matmul_f64(g, &transpose(&b, k, n), m, n, k));
            accumulate(grads, rhs, matmul_f64(&transpose(&a, m, k), g, k, m, n));
        }

        Op::FullyConnected { data, weight, bias } => {
            // Y[b,u] = X[b,k] · W[u,k]ᵀ + bias[u]
            let batch = data.dims()[0];
            let (units, in_units) = (weight.dims()[0], weight.dims()[1]);
            let x = data.to_f64_vec()?;
            let w = weight.to_f64_vec()?;
            // dX = dY · W, dW = dYᵀ · X, dbias = Σ_b dY
            accumulate(grads, data, matmul_f64(g, &w, batch, units, in_units));
            accumulate(
                grads,
                weight,
                matmul_f64(&transpose(g, batch, units), &x, units, batch, in_units),
            );
            if let Some(b) = bias {
                let mut db = vec![0.0; units];
                for row in g.chunks_exact(units) {
                    db.iter_mut().zip(row).for_each(|(d, v)| *d += v);
                }
                accumulate(grads, b, db);
            }
        }

        Op::SumAll { input } => {
            accumulate(grads, input, vec![g[0]; input.elem_count()]);
        }

        Op::MeanAll { input } => {
            let n = input.elem_count().max(1) as f64;
            accumulate(grads, input, vec![g[0] / n; input.elem_count()]);
        }

        Op::Reshape { input } => {
            accumulate(grads, input, g.to_vec());
        }

        Op::LogSoftmax { input } => {
            // dx = g - softmax(x) * Σ_row g
            let cols = last_axis(input)?;
            let y = node.to_f64_vec()?;
            let mut dx = Vec::with_capacity(y.len());
            for (y_row, g_row) in y.chunks_exact(cols).zip(g.chunks_exact(cols)) {
                let total: f64 = g_row.iter().sum();
                dx.extend(y_row.iter().zip(g_row).map(|(y, g)| g - y.exp() * total));
            }
            accumulate(grads, input, dx);
        }

        Op::Pick { input, indices } => {
            let cols = last_axis(input)?;
            let mut dx = vec![0.0; input.elem_count()];
            for (r, (&c, g)) in indices.iter().zip(g).enumerate() {
                dx[r * cols + c] += g;
            }
            accumulate(grads, input, dx);
        }

        Op::SumLastAxis { input } => {
            let cols = last_axis(input)?;
            let dx = g.iter().flat_map(|&v| std::iter::repeat(v).take(cols)).collect();
            accumulate(grads, input, dx);
        }

        Op::MeanExcept { input, axis } => {
            let (outer, size, inner) = split_axis(input.shape(), *axis)?;
            let n = (outer * inner).max(1) as f64;
            let mut dx = Vec::with_capacity(input.elem_count());
            for _ in 0..outer {
                for &ga in g.iter().take(size) {
                    dx.extend(std::iter::repeat(ga / n).take(inner));
                }
            }
            accumulate(grads, input, dx);
        }

        Op::BroadcastMul { lhs, rhs } => {
            let map = broadcast_map(lhs.shape(), rhs.shape())?;
            let a = lhs.to_f64_vec()?;
            let b = rhs.to_f64_vec()?;
            accumulate(grads, lhs, g.iter().zip(&map).map(|(g, &j)| g * b[j]).collect());
            let mut db = vec![0.0; rhs.elem_count()];
            for ((g, a), &j) in g.iter().zip(&a).zip(&map) {
                db[j] += g * a;
            }
            accumulate(grads, rhs, db);
        }
    }
    Ok(())
}

/// Compute gradients of `heads` with respect to every marked variable in
/// their recorded graph, seeding each head with ones.
pub fn backward(heads: &[NDArray]) -> Result<()> {
    backward_with(heads, None)
}

/// Like [`backward`], with explicit head gradients.
pub fn backward_with(heads: &[NDArray], head_grads: Option<&[NDArray]>) -> Result<()> {
    if let Some(hg) = head_grads {
        if hg.len() != heads.len() {
            return Err(Error::InvalidArgument(format!(
                "{} head gradients given for {} heads",
                hg.len(),
                heads.len()
            )));
        }
    }
    for head in heads {
        if !head.requires_grad() {
            bail!(
                "cannot differentiate {head:?}: it was not computed inside a recording scope from any marked variable"
            );
        }
    }

    let topo = build_topo(heads);
    let mut grads: HashMap<ArrayId, Vec<f64>> = HashMap::new();
    for (i, head) in heads.iter().enumerate() {
        let seed = match head_grads {
            Some(hg) => {
                if hg[i].shape() != head.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: head.shape().clone(),
                        got: hg[i].shape().clone(),
                    });
                }
                hg[i].to_f64_vec()?
            }
            None => vec![1.0; head.elem_count()],
        };
        accumulate(&mut grads, head, seed);
    }

    for node in topo.iter().rev() {
        let Some(g) = grads.get(&node.id()).cloned() else {
            continue;
        };
        propagate(node, &g, &mut grads)?;
    }

    for node in &topo {
        let Some(slot) = node.grad_slot() else {
            continue;
        };
        let g = grads
            .remove(&node.id())
            .unwrap_or_else(|| vec![0.0; node.elem_count()]);
        match slot.req {
            GradReq::Write => slot.buffer.assign(&g)?,
            GradReq::Add => {
                let mut current = slot.buffer.to_f64_vec()?;
                current.iter_mut().zip(&g).for_each(|(c, v)| *c += v);
                slot.buffer.assign(&current)?;
            }
            GradReq::Null => continue,
        }
        node.set_fresh_grad(true);
    }
    tracing::trace!(heads = heads.len(), nodes = topo.len(), "backward pass complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, DType};
    use approx::assert_relative_eq;

    fn var(values: &[f64], shape: impl Into<crate::Shape>) -> (NDArray, NDArray) {
        let x = NDArray::from_f64_slice(values, shape, DType::F64, Context::cpu(0)).unwrap();
        let g = NDArray::zeros(x.shape().clone(), DType::F64, Context::cpu(0)).unwrap();
        mark_variables(&[x.clone()], &[g.clone()], &[GradReq::Write]).unwrap();
        (x, g)
    }

    #[test]
    fn test_flags_start_false() {
        assert!(!is_recording());
        assert!(!is_training());
    }

    #[test]
    fn test_nested_scopes_restore_previous_values() {
        record(true, || {
            assert!(is_recording() && is_training());
            pause(false, || {
                assert!(!is_recording() && !is_training());
                train_mode(|| assert!(is_training() && !is_recording()));
                assert!(!is_training());
            });
            assert!(is_recording() && is_training());
            predict_mode(|| assert!(is_recording() && !is_training()));
        });
        assert!(!is_recording() && !is_training());
    }

    #[test]
    fn test_scopes_restore_on_error_return() {
        fn failing() -> Result<()> {
            let _outer = RecordingScope::record(true);
            let _inner = RecordingScope::pause(false);
            Err(Error::msg("boom"))
        }
        assert!(failing().is_err());
        assert!(!is_recording() && !is_training());
    }

    #[test]
    fn test_grad_req_parse() {
        assert_eq!("add".parse::<GradReq>().unwrap(), GradReq::Add);
        assert!("sometimes".parse::<GradReq>().is_err());
    }

    #[test]
    fn test_backward_square_sum() {
        let (x, g) = var(&[1.0, 2.0, 3.0], 3);
        let y = record(true, || x.square().unwrap().sum_all().unwrap());
        y.backward().unwrap();
        assert_eq!(g.to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]);
        assert!(x.fresh_grad());
    }

    #[test]
    fn test_backward_outside_recording_fails() {
        let (x, _g) = var(&[1.0], 1);
        let y = x.square().unwrap();
        assert!(y.backward().is_err());
    }

    #[test]
    fn test_grad_add_accumulates() {
        let x = NDArray::from_f64_slice(&[3.0], 1, DType::F64, Context::cpu(0)).unwrap();
        let g = NDArray::zeros(1, DType::F64, Context::cpu(0)).unwrap();
        mark_variables(&[x.clone()], &[g.clone()], &[GradReq::Add]).unwrap();
        for _ in 0..2 {
            record(true, || x.affine(2.0, 1.0).unwrap()).backward().unwrap();
        }
        assert_eq!(g.to_f64_vec().unwrap(), vec![4.0]);
    }

    #[test]
    fn test_fully_connected_gradients() {
        // y = sum(x · wᵀ + b) with x [1,2], w [1,2], b [1]
        let (x, gx) = var(&[1.0, 2.0], (1, 2));
        let (w, gw) = var(&[3.0, 4.0], (1, 2));
        let (b, gb) = var(&[0.5], 1);
        record(true, || {
            NDArray::fully_connected(&x, &w, Some(&b))
                .unwrap()
                .sum_all()
                .unwrap()
        })
        .backward()
        .unwrap();
        assert_eq!(gx.to_f64_vec().unwrap(), vec![3.0, 4.0]);
        assert_eq!(gw.to_f64_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(gb.to_f64_vec().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_matmul_gradients() {
        let (a, ga) = var(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let (b, gb) = var(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        record(true, || a.matmul(&b).unwrap().sum_all().unwrap())
            .backward()
            .unwrap();
        assert_eq!(ga.to_f64_vec().unwrap(), vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(gb.to_f64_vec().unwrap(), vec![4.0, 4.0, 6.0, 6.0]);
    }

    #[test]
    fn test_sigmoid_gradient_at_zero() {
        let (x, g) = var(&[0.0], 1);
        record(true, || x.sigmoid().unwrap().mean_all().unwrap())
            .backward()
            .unwrap();
        assert_relative_eq!(g.to_f64_vec().unwrap()[0], 0.25);
    }

    #[test]
    fn test_log_softmax_pick_gradient() {
        // -log softmax([0, 0])[1] has gradient softmax - onehot.
        let (x, g) = var(&[0.0, 0.0], (1, 2));
        let label = NDArray::from_f64_slice(&[1.0], 1, DType::F64, Context::cpu(0)).unwrap();
        let loss = record(true, || {
            x.log_softmax().unwrap().pick(&label).unwrap().affine(-1.0, 0.0).unwrap().sum_all().unwrap()
        });
        assert_relative_eq!(loss.to_scalar().unwrap(), std::f64::consts::LN_2, epsilon = 1e-12);
        loss.backward().unwrap();
        let grad = g.to_f64_vec().unwrap();
        assert_relative_eq!(grad[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(grad[1], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_except_and_abs_gradients() {
        let (x, g) = var(&[-2.0, 3.0, 0.0, 1.0, -1.0, 4.0], (2, 3));
        let per_row = record(true, || x.abs().unwrap().mean_except(0).unwrap());
        assert_eq!(per_row.to_f64_vec().unwrap(), vec![5.0 / 3.0, 2.0]);
        record(true, || per_row.sum_all().unwrap()).backward().unwrap();
        let third = 1.0 / 3.0;
        assert_eq!(g.to_f64_vec().unwrap(), vec![-third, third, 0.0, third, -third, third]);
    }

    #[test]
    fn test_broadcast_mul_gradients() {
        let (a, ga) = var(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let (b, gb) = var(&[10.0, 20.0], (2, 1));
        let y = record(true, || a.broadcast_mul(&b).unwrap());
        assert_eq!(y.to_f64_vec().unwrap(), vec![10.0, 20.0, 60.0, 80.0]);
        record(true, || y.sum_all().unwrap()).backward().unwrap();
        assert_eq!(ga.to_f64_vec().unwrap(), vec![10.0, 10.0, 20.0, 20.0]);
        assert_eq!(gb.to_f64_vec().unwrap(), vec![3.0, 7.0]);
    }
}
