// Op — Recorded operation that produced an array
//
// While autograd is recording, every differentiable NDArray operation stores
// HOW its output was produced, holding cheap Arc clones of its inputs. The
// outputs of a forward pass therefore form a DAG rooted at the loss, and
// `autograd::backward` walks it in reverse.
//
//   y = relu(x · Wᵀ + b)
//     y.op = Unary { input: fc, op: Relu }
//     fc.op = FullyConnected { data: x, weight: W, bias: Some(b) }
//     W.op = b.op = x.op = None      (leaves)
//
// Arrays created outside a recording scope, or whose inputs carry no
// gradient attachment, record Op::None and are leaves.

use crate::ndarray::NDArray;

/// Unique identifier for an array. Used as keys while propagating gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub(crate) u64);

impl ArrayId {
    /// Generate a new unique id (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ArrayId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ArrayId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
    Square,
    Exp,
    Abs,
}

/// Records the operation that produced an array, storing references to inputs.
#[derive(Clone)]
pub enum Op {
    /// Leaf array.
    None,

    /// Element-wise binary on same-shaped inputs.
    Binary {
        lhs: NDArray,
        rhs: NDArray,
        op: BinaryOp,
    },

    /// Element-wise unary.
    Unary { input: NDArray, op: UnaryOp },

    /// result = input * mul + add
    Affine { input: NDArray, mul: f64, add: f64 },

    /// 2-D matrix product.
    Matmul { lhs: NDArray, rhs: NDArray },

    /// result = flatten(data) · weightᵀ + bias
    FullyConnected {
        data: NDArray,
        weight: NDArray,
        bias: Option<NDArray>,
    },

    /// Sum of all elements (scalar output).
    SumAll { input: NDArray },

    /// Mean of all elements (scalar output).
    MeanAll { input: NDArray },

    /// Same elements, different shape.
    Reshape { input: NDArray },

    /// log(softmax(input)) over the last axis.
    LogSoftmax { input: NDArray },

    /// One element per row of the last axis: `out[r] = input[r, indices[r]]`.
    Pick { input: NDArray, indices: Vec<usize> },

    /// Sum over the last axis, kept with size 1.
    SumLastAxis { input: NDArray },

    /// Mean over every axis except `axis`.
    MeanExcept { input: NDArray, axis: usize },

    /// lhs * rhs, with rhs repeated along its size-1 axes.
    BroadcastMul { lhs: NDArray, rhs: NDArray },
}

impl Op {
    /// The input arrays this op depends on, in argument order.
    pub fn inputs(&self) -> Vec<&NDArray> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } | Op::BroadcastMul { lhs, rhs } => {
                vec![lhs, rhs]
            }
            Op::Unary { input, .. }
            | Op::Affine { input, .. }
            | Op::SumAll { input }
            | Op::MeanAll { input }
            | Op::Reshape { input }
            | Op::LogSoftmax { input }
            | Op::Pick { input, .. }
            | Op::SumLastAxis { input }
            | Op::MeanExcept { input, .. } => vec![input],
            Op::FullyConnected { data, weight, bias } => {
                let mut v = vec![data, weight];
                if let Some(b) = bias {
                    v.push(b);
                }
                v
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }

    /// Short operator name, for debugging output.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Binary { op, .. } => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
            },
            Op::Unary { op, .. } => match op {
                UnaryOp::Relu => "relu",
                UnaryOp::Sigmoid => "sigmoid",
                UnaryOp::Tanh => "tanh",
                UnaryOp::Square => "square",
                UnaryOp::Exp => "exp",
                UnaryOp::Abs => "abs",
            },
            Op::Affine { .. } => "affine",
            Op::Matmul { .. } => "matmul",
            Op::FullyConnected { .. } => "fully_connected",
            Op::SumAll { .. } => "sum",
            Op::MeanAll { .. } => "mean",
            Op::Reshape { .. } => "reshape",
            Op::LogSoftmax { .. } => "log_softmax",
            Op::Pick { .. } => "pick",
            Op::SumLastAxis { .. } => "sum_last_axis",
            Op::MeanExcept { .. } => "mean_except",
            Op::BroadcastMul { .. } => "broadcast_mul",
        }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<_> = self.inputs().iter().map(|a| a.id()).collect();
        write!(f, "Op::{}({:?})", self.name(), ids)
    }
}
