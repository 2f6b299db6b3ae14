use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand_distr::{Distribution, Normal, Uniform};

use crate::autograd::{self, GradReq};
use crate::bail;
use crate::context::Context;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::op::{ArrayId, BinaryOp, Op, UnaryOp};
use crate::shape::Shape;

// NDArray — Host-backed dense array
//
// This is the reference implementation of the native tensor collaborator the
// parameter machinery calls into. It provides exactly the primitives that
// machinery needs:
//
//   zeros / full / from_f64_slice  — allocation on a context
//   copy_to(ctx)                   — independent replica on another context
//   astype(dtype)                  — element type conversion
//   fill / copy_from               — in-place writes, no allocation
//   mark_variables / backward      — gradient attachment and reverse pass
//
// plus a handful of differentiable operations (add, matmul, fully_connected,
// relu, ...) so that blocks can run real forward/backward passes.
//
// MEMORY MODEL:
//
//   NDArray is a handle around Arc<NDArrayInner>. Cloning is O(1) and two
//   clones are the same array (same id, same storage). Storage lives behind
//   Arc<RwLock<_>> so in-place writes work through `&self` and `detach()`
//   can hand out a leaf view of the same elements.
//
//   "Context" is a tag on the array. All storage is host memory; two arrays
//   on different contexts never share storage because the only way to move
//   between contexts is `copy_to`, which always copies.

/// Typed element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F16(Vec<half::f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

macro_rules! map_storage {
    ($s:expr, $v:ident => $body:expr) => {
        match $s {
            Storage::F16($v) => $body,
            Storage::F32($v) => $body,
            Storage::F64($v) => $body,
            Storage::I8($v) => $body,
            Storage::I32($v) => $body,
            Storage::I64($v) => $body,
            Storage::U8($v) => $body,
        }
    };
}

fn convert<T: WithDType>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&x| T::from_f64(x)).collect()
}

fn decode<T, const N: usize>(raw: &[u8], f: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|c| {
            let mut b = [0u8; N];
            b.copy_from_slice(c);
            f(b)
        })
        .collect()
}

impl Storage {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F16 => Storage::F16(vec![half::f16::ZERO; len]),
            DType::F32 => Storage::F32(vec![0.0; len]),
            DType::F64 => Storage::F64(vec![0.0; len]),
            DType::I8 => Storage::I8(vec![0; len]),
            DType::I32 => Storage::I32(vec![0; len]),
            DType::I64 => Storage::I64(vec![0; len]),
            DType::U8 => Storage::U8(vec![0; len]),
        }
    }

    pub fn from_f64(dtype: DType, data: &[f64]) -> Self {
        match dtype {
            DType::F16 => Storage::F16(convert(data)),
            DType::F32 => Storage::F32(convert(data)),
            DType::F64 => Storage::F64(data.to_vec()),
            DType::I8 => Storage::I8(convert(data)),
            DType::I32 => Storage::I32(convert(data)),
            DType::I64 => Storage::I64(convert(data)),
            DType::U8 => Storage::U8(convert(data)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F16(_) => DType::F16,
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I8(_) => DType::I8,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
            Storage::U8(_) => DType::U8,
        }
    }

    pub fn len(&self) -> usize {
        map_storage!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        map_storage!(self, v => v.iter().map(|&x| WithDType::to_f64(x)).collect())
    }

    /// Overwrite every element with `value`, converted to the element type.
    pub fn fill(&mut self, value: f64) {
        map_storage!(self, v => v.iter_mut().for_each(|e| *e = WithDType::from_f64(value)))
    }

    /// Overwrite elements from f64 values; lengths must already agree.
    pub fn assign(&mut self, data: &[f64]) {
        map_storage!(self, v => v
            .iter_mut()
            .zip(data.iter())
            .for_each(|(e, &x)| *e = WithDType::from_f64(x)))
    }

    /// Little-endian raw bytes, exact for every dtype.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        map_storage!(self, v => v.iter().flat_map(|x| x.to_le_bytes()).collect())
    }

    pub fn from_le_bytes(dtype: DType, raw: &[u8]) -> Result<Self> {
        if raw.len() % dtype.size_in_bytes() != 0 {
            bail!(
                "{} bytes is not a whole number of {dtype} elements",
                raw.len()
            );
        }
        Ok(match dtype {
            DType::F16 => Storage::F16(decode(raw, half::f16::from_le_bytes)),
            DType::F32 => Storage::F32(decode(raw, f32::from_le_bytes)),
            DType::F64 => Storage::F64(decode(raw, f64::from_le_bytes)),
            DType::I8 => Storage::I8(decode(raw, i8::from_le_bytes)),
            DType::I32 => Storage::I32(decode(raw, i32::from_le_bytes)),
            DType::I64 => Storage::I64(decode(raw, i64::from_le_bytes)),
            DType::U8 => Storage::U8(raw.to_vec()),
        })
    }
}

/// Gradient buffer attached to a variable by `autograd::mark_variables`.
#[derive(Clone)]
pub(crate) struct GradSlot {
    pub(crate) buffer: NDArray,
    pub(crate) req: GradReq,
}

struct NDArrayInner {
    id: ArrayId,
    storage: Arc<RwLock<Storage>>,
    shape: Shape,
    dtype: DType,
    context: Context,
    /// The operation that created this array. `Op::None` for leaves.
    op: Op,
    grad: RwLock<Option<GradSlot>>,
    /// Set by backward when it writes this array's gradient; cleared by the
    /// optimizer step that consumes it.
    fresh_grad: AtomicBool,
}

/// A dense n-dimensional array tagged with a context.
#[derive(Clone)]
pub struct NDArray {
    inner: Arc<NDArrayInner>,
}

impl std::fmt::Debug for NDArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NDArray(id={:?}, shape={}, dtype={}, context={})",
            self.inner.id, self.inner.shape, self.inner.dtype, self.inner.context,
        )
    }
}

impl std::fmt::Display for NDArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.inner.storage.read().to_f64_vec();
        write!(
            f,
            "{:?}\n<NDArray {} {} @{}>",
            values, self.inner.shape, self.inner.dtype, self.inner.context
        )
    }
}

impl NDArray {
    // Internal constructors

    fn from_parts(storage: Storage, shape: Shape, context: Context, op: Op) -> Self {
        let dtype = storage.dtype();
        NDArray {
            inner: Arc::new(NDArrayInner {
                id: ArrayId::new(),
                storage: Arc::new(RwLock::new(storage)),
                shape,
                dtype,
                context,
                op,
                grad: RwLock::new(None),
                fresh_grad: AtomicBool::new(false),
            }),
        }
    }

    /// Build an operation result; the op is kept only when recording and at
    /// least one input participates in differentiation.
    fn op_result(data: &[f64], shape: Shape, like: &NDArray, op: Op) -> Self {
        let track = autograd::is_recording() && op.inputs().iter().any(|a| a.requires_grad());
        let op = if track { op } else { Op::None };
        Self::from_parts(Storage::from_f64(like.dtype(), data), shape, like.context(), op)
    }

    // Creation

    /// Zero-filled array.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, context: Context) -> Result<Self> {
        let shape = shape.into();
        let n = shape.elem_count();
        Ok(Self::from_parts(Storage::zeros(dtype, n), shape, context, Op::None))
    }

    /// One-filled array.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, context: Context) -> Result<Self> {
        Self::full(shape, 1.0, dtype, context)
    }

    /// Array with every element equal to `value`.
    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType, context: Context) -> Result<Self> {
        let arr = Self::zeros(shape, dtype, context)?;
        arr.fill(value);
        Ok(arr)
    }

    /// Array from row-major f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        context: Context,
    ) -> Result<Self> {
        let shape = shape.into();
        check_count(&shape, data.len())?;
        Ok(Self::from_parts(Storage::from_f64(dtype, data), shape, context, Op::None))
    }

    /// Array from a typed vector; the dtype follows `T`.
    pub fn from_vec<T: WithDType>(
        data: Vec<T>,
        shape: impl Into<Shape>,
        context: Context,
    ) -> Result<Self> {
        Self::from_storage(T::into_storage(data), shape, context)
    }

    /// Array from raw storage.
    pub fn from_storage(storage: Storage, shape: impl Into<Shape>, context: Context) -> Result<Self> {
        let shape = shape.into();
        check_count(&shape, storage.len())?;
        Ok(Self::from_parts(storage, shape, context, Op::None))
    }

    // Accessors

    pub fn id(&self) -> ArrayId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn context(&self) -> Context {
        self.inner.context
    }

    pub fn op(&self) -> &Op {
        &self.inner.op
    }

    /// Whether `self` and `other` are the same array (not just equal values).
    pub fn ptr_eq(&self, other: &NDArray) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether `self` and `other` read and write the same elements.
    pub fn shares_storage(&self, other: &NDArray) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Copy of the raw storage.
    pub fn storage(&self) -> Storage {
        self.inner.storage.read().clone()
    }

    /// All elements as f64, row-major.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.inner.storage.read().to_f64_vec())
    }

    /// The single element of a one-element array.
    pub fn to_scalar(&self) -> Result<f64> {
        let values = self.to_f64_vec()?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::msg(format!(
                "not a scalar: array has shape {}",
                self.shape()
            ))),
        }
    }

    // Copies and in-place writes

    /// An independent copy of this array on `context`.
    pub fn copy_to(&self, context: Context) -> Result<NDArray> {
        let storage = self.inner.storage.read().clone();
        Ok(Self::from_parts(storage, self.shape().clone(), context, Op::None))
    }

    /// An independent copy converted to `dtype`, on the same context.
    pub fn astype(&self, dtype: DType) -> Result<NDArray> {
        let values = self.inner.storage.read().to_f64_vec();
        Self::from_f64_slice(&values, self.shape().clone(), dtype, self.context())
    }

    /// A leaf sharing this array's storage, without its recorded history.
    pub fn detach(&self) -> NDArray {
        NDArray {
            inner: Arc::new(NDArrayInner {
                id: ArrayId::new(),
                storage: Arc::clone(&self.inner.storage),
                shape: self.shape().clone(),
                dtype: self.dtype(),
                context: self.context(),
                op: Op::None,
                grad: RwLock::new(None),
                fresh_grad: AtomicBool::new(false),
            }),
        }
    }

    /// Set every element to `value` in place.
    pub fn fill(&self, value: f64) {
        self.inner.storage.write().fill(value);
    }

    /// Overwrite this array's elements with `values` in place.
    pub fn assign(&self, values: &[f64]) -> Result<()> {
        check_count(self.shape(), values.len())?;
        self.inner.storage.write().assign(values);
        Ok(())
    }

    /// Copy `src`'s elements into this array in place, converting dtype.
    pub fn copy_from(&self, src: &NDArray) -> Result<()> {
        if src.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        if self.shares_storage(src) {
            return Ok(());
        }
        let values = src.inner.storage.read().to_f64_vec();
        self.inner.storage.write().assign(&values);
        Ok(())
    }

    /// Fill in place with samples from U(low, high).
    pub fn fill_uniform(&self, low: f64, high: f64) -> Result<()> {
        if !(low < high) {
            if low == high {
                self.fill(low);
                return Ok(());
            }
            return Err(Error::InvalidArgument(format!(
                "uniform bounds must satisfy low <= high, got [{low}, {high}]"
            )));
        }
        let dist = Uniform::new(low, high);
        let mut rng = rand::thread_rng();
        let values: Vec<f64> = (0..self.elem_count()).map(|_| dist.sample(&mut rng)).collect();
        self.assign(&values)
    }

    /// Fill in place with samples from N(mean, std²).
    pub fn fill_normal(&self, mean: f64, std: f64) -> Result<()> {
        let dist = Normal::new(mean, std)
            .map_err(|e| Error::InvalidArgument(format!("normal distribution: {e}")))?;
        let mut rng = rand::thread_rng();
        let values: Vec<f64> = (0..self.elem_count()).map(|_| dist.sample(&mut rng)).collect();
        self.assign(&values)
    }

    // Gradient attachment

    pub(crate) fn grad_slot(&self) -> Option<GradSlot> {
        self.inner.grad.read().clone()
    }

    pub(crate) fn set_grad_slot(&self, slot: Option<GradSlot>) {
        *self.inner.grad.write() = slot;
    }

    /// The gradient buffer attached by `mark_variables`, if any.
    pub fn grad(&self) -> Option<NDArray> {
        self.inner.grad.read().as_ref().map(|s| s.buffer.clone())
    }

    /// How backward writes into this array's gradient buffer.
    pub fn grad_req(&self) -> GradReq {
        self.inner
            .grad
            .read()
            .as_ref()
            .map(|s| s.req)
            .unwrap_or(GradReq::Null)
    }

    /// Whether backward should propagate into this array.
    pub fn requires_grad(&self) -> bool {
        !self.inner.op.is_leaf() || self.grad_req() != GradReq::Null
    }

    /// True if backward has written this array's gradient since it was last
    /// marked consumed.
    pub fn fresh_grad(&self) -> bool {
        self.inner.fresh_grad.load(Ordering::Acquire)
    }

    pub fn set_fresh_grad(&self, fresh: bool) {
        self.inner.fresh_grad.store(fresh, Ordering::Release);
    }

    /// Run the reverse pass from this array. See [`autograd::backward`].
    pub fn backward(&self) -> Result<()> {
        autograd::backward(std::slice::from_ref(self))
    }

    // Differentiable operations

    fn binary(&self, rhs: &NDArray, op: BinaryOp) -> Result<NDArray> {
        self.check_same_layout(rhs)?;
        let a = self.to_f64_vec()?;
        let b = rhs.to_f64_vec()?;
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |x, y| x + y,
            BinaryOp::Sub => |x, y| x - y,
            BinaryOp::Mul => |x, y| x * y,
        };
        let out: Vec<f64> = a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
        let recorded = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::op_result(&out, self.shape().clone(), self, recorded))
    }

    pub fn add(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &NDArray) -> Result<NDArray> {
        self.binary(rhs, BinaryOp::Mul)
    }

    fn unary(&self, op: UnaryOp) -> Result<NDArray> {
        let out: Vec<f64> = self
            .to_f64_vec()?
            .into_iter()
            .map(|x| unary_forward(op, x))
            .collect();
        let recorded = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::op_result(&out, self.shape().clone(), self, recorded))
    }

    pub fn relu(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn square(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Square)
    }

    pub fn exp(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Exp)
    }

    pub fn abs(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Abs)
    }

    /// `self * mul + add`, element-wise.
    pub fn affine(&self, mul: f64, add: f64) -> Result<NDArray> {
        let out: Vec<f64> = self.to_f64_vec()?.iter().map(|&x| x * mul + add).collect();
        let recorded = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::op_result(&out, self.shape().clone(), self, recorded))
    }

    /// 2-D matrix product `[m, k] · [k, n] → [m, n]`.
    pub fn matmul(&self, rhs: &NDArray) -> Result<NDArray> {
        self.check_same_device(rhs)?;
        let (m, k) = as_matrix(self)?;
        let (k2, n) = as_matrix(rhs)?;
        if k != k2 {
            bail!(
                "matmul shape mismatch: [{m}x{k}] @ [{k2}x{n}], inner dims must match"
            );
        }
        let out = matmul_f64(&self.to_f64_vec()?, &rhs.to_f64_vec()?, m, k, n);
        let recorded = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::op_result(&out, Shape::from((m, n)), self, recorded))
    }

    /// Dense layer kernel: `flatten(data) · weightᵀ + bias`.
    ///
    /// `data` is `[batch, ...]` and is flattened to `[batch, in_units]`,
    /// `weight` is `[units, in_units]`, `bias` is `[units]`.
    pub fn fully_connected(
        data: &NDArray,
        weight: &NDArray,
        bias: Option<&NDArray>,
    ) -> Result<NDArray> {
        data.check_same_device(weight)?;
        let (units, in_units) = as_matrix(weight)?;
        let (batch, features) = flatten_2d(data)?;
        if features != in_units {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((batch, in_units)),
                got: data.shape().clone(),
            });
        }
        let x = data.to_f64_vec()?;
        let w = weight.to_f64_vec()?;
        let mut out = vec![0.0; batch * units];
        for i in 0..batch {
            for u in 0..units {
                let row = &x[i * in_units..(i + 1) * in_units];
                let wrow = &w[u * in_units..(u + 1) * in_units];
                out[i * units + u] = row.iter().zip(wrow).map(|(a, b)| a * b).sum();
            }
        }
        if let Some(b) = bias {
            data.check_same_device(b)?;
            if b.dims() != [units] {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(units),
                    got: b.shape().clone(),
                });
            }
            let bv = b.to_f64_vec()?;
            for i in 0..batch {
                for u in 0..units {
                    out[i * units + u] += bv[u];
                }
            }
        }
        let recorded = Op::FullyConnected {
            data: data.clone(),
            weight: weight.clone(),
            bias: bias.cloned(),
        };
        Ok(Self::op_result(&out, Shape::from((batch, units)), data, recorded))
    }

    /// Sum of all elements as a scalar array.
    pub fn sum_all(&self) -> Result<NDArray> {
        let total: f64 = self.to_f64_vec()?.iter().sum();
        let recorded = Op::SumAll { input: self.clone() };
        Ok(Self::op_result(&[total], Shape::from(()), self, recorded))
    }

    /// Mean of all elements as a scalar array.
    pub fn mean_all(&self) -> Result<NDArray> {
        let values = self.to_f64_vec()?;
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        let recorded = Op::MeanAll { input: self.clone() };
        Ok(Self::op_result(&[mean], Shape::from(()), self, recorded))
    }

    /// The same elements viewed under `shape`, which must hold as many.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<NDArray> {
        let shape = shape.into();
        check_count(&shape, self.elem_count())?;
        let recorded = Op::Reshape { input: self.clone() };
        Ok(Self::op_result(&self.to_f64_vec()?, shape, self, recorded))
    }

    /// `log(softmax(x))` over the last axis, computed as
    /// `x - max - log(sum(exp(x - max)))` per row.
    pub fn log_softmax(&self) -> Result<NDArray> {
        let cols = last_axis(self)?;
        let x = self.to_f64_vec()?;
        let mut out = Vec::with_capacity(x.len());
        for row in x.chunks_exact(cols) {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f64>().ln() + max;
            out.extend(row.iter().map(|v| v - log_sum));
        }
        let recorded = Op::LogSoftmax { input: self.clone() };
        Ok(Self::op_result(&out, self.shape().clone(), self, recorded))
    }

    /// Select one entry of the last axis per row. `index` holds one class
    /// id per row; the last axis is kept with size 1.
    pub fn pick(&self, index: &NDArray) -> Result<NDArray> {
        let cols = last_axis(self)?;
        let rows = self.elem_count() / cols;
        if index.elem_count() != rows {
            return Err(Error::ElementCountMismatch {
                shape: Shape::new(self.dims()[..self.rank() - 1].to_vec()),
                expected: rows,
                got: index.elem_count(),
            });
        }
        let indices = index
            .to_f64_vec()?
            .into_iter()
            .map(|v| {
                if v < 0.0 || v.fract() != 0.0 || v as usize >= cols {
                    return Err(Error::InvalidArgument(format!(
                        "pick index {v} is not a class id in 0..{cols}"
                    )));
                }
                Ok(v as usize)
            })
            .collect::<Result<Vec<_>>>()?;
        let x = self.to_f64_vec()?;
        let out: Vec<f64> = indices.iter().enumerate().map(|(r, &c)| x[r * cols + c]).collect();
        let recorded = Op::Pick {
            input: self.clone(),
            indices,
        };
        Ok(Self::op_result(&out, keep_last_axis(self.shape()), self, recorded))
    }

    /// Sum over the last axis, kept with size 1.
    pub fn sum_last_axis(&self) -> Result<NDArray> {
        let cols = last_axis(self)?;
        let out: Vec<f64> = self
            .to_f64_vec()?
            .chunks_exact(cols)
            .map(|row| row.iter().sum())
            .collect();
        let recorded = Op::SumLastAxis { input: self.clone() };
        Ok(Self::op_result(&out, keep_last_axis(self.shape()), self, recorded))
    }

    /// Mean over every axis except `axis`. The result has shape
    /// `[dims[axis]]`.
    pub fn mean_except(&self, axis: usize) -> Result<NDArray> {
        let (outer, size, inner) = split_axis(self.shape(), axis)?;
        let x = self.to_f64_vec()?;
        let mut out = vec![0.0; size];
        for o in 0..outer {
            for (a, total) in out.iter_mut().enumerate() {
                let start = (o * size + a) * inner;
                *total += x[start..start + inner].iter().sum::<f64>();
            }
        }
        let n = (outer * inner).max(1) as f64;
        out.iter_mut().for_each(|v| *v /= n);
        let recorded = Op::MeanExcept {
            input: self.clone(),
            axis,
        };
        Ok(Self::op_result(&out, Shape::from(size), self, recorded))
    }

    /// Element-wise product with `rhs` repeated along its size-1 axes.
    /// `rhs` must have the same rank as `self`.
    pub fn broadcast_mul(&self, rhs: &NDArray) -> Result<NDArray> {
        self.check_same_device(rhs)?;
        let map = broadcast_map(self.shape(), rhs.shape())?;
        let b = rhs.to_f64_vec()?;
        let out: Vec<f64> = self
            .to_f64_vec()?
            .iter()
            .zip(&map)
            .map(|(a, &j)| a * b[j])
            .collect();
        let recorded = Op::BroadcastMul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::op_result(&out, self.shape().clone(), self, recorded))
    }

    // Checks

    fn check_same_device(&self, other: &NDArray) -> Result<()> {
        if self.context() != other.context() {
            bail!(
                "arrays live on different contexts: {} and {}",
                self.context(),
                other.context()
            );
        }
        Ok(())
    }

    fn check_same_layout(&self, other: &NDArray) -> Result<()> {
        self.check_same_device(other)?;
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: other.shape().clone(),
            });
        }
        if self.dtype() != other.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: other.dtype(),
            });
        }
        Ok(())
    }
}

fn check_count(shape: &Shape, got: usize) -> Result<()> {
    if shape.elem_count() != got {
        return Err(Error::ElementCountMismatch {
            shape: shape.clone(),
            expected: shape.elem_count(),
            got,
        });
    }
    Ok(())
}

fn as_matrix(a: &NDArray) -> Result<(usize, usize)> {
    match a.dims() {
        [m, n] => Ok((*m, *n)),
        _ => Err(Error::msg(format!(
            "expected a 2-D array, got shape {}",
            a.shape()
        ))),
    }
}

/// Size of the last axis, which must exist and be nonzero.
pub(crate) fn last_axis(a: &NDArray) -> Result<usize> {
    match a.dims().last() {
        Some(&cols) if cols > 0 => Ok(cols),
        _ => Err(Error::invalid_shape(
            format!("{a:?}"),
            "an operation over the last axis needs a nonempty last axis",
        )),
    }
}

fn keep_last_axis(shape: &Shape) -> Shape {
    let mut dims = shape.dims().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = 1;
    }
    Shape::new(dims)
}

/// `(outer, dims[axis], inner)` element counts around `axis`.
pub(crate) fn split_axis(shape: &Shape, axis: usize) -> Result<(usize, usize, usize)> {
    let dims = shape.dims();
    if axis >= dims.len() {
        return Err(Error::InvalidArgument(format!(
            "axis {axis} is out of range for shape {shape}"
        )));
    }
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    Ok((outer, dims[axis], inner))
}

/// For every flat index of `target`, the flat index of `src` it reads when
/// `src` is repeated along its size-1 axes.
pub(crate) fn broadcast_map(target: &Shape, src: &Shape) -> Result<Vec<usize>> {
    let (t, s) = (target.dims(), src.dims());
    if t.len() != s.len() || t.iter().zip(s).any(|(&a, &b)| b != 1 && b != a) {
        return Err(Error::ShapeMismatch {
            expected: target.clone(),
            got: src.clone(),
        });
    }
    let mut strides = vec![0; s.len()];
    let mut stride = 1;
    for d in (0..s.len()).rev() {
        strides[d] = if s[d] == 1 { 0 } else { stride };
        stride *= s[d];
    }
    let mut map = Vec::with_capacity(target.elem_count());
    let mut coord = vec![0; t.len()];
    for _ in 0..target.elem_count() {
        map.push(coord.iter().zip(&strides).map(|(c, s)| c * s).sum());
        for d in (0..t.len()).rev() {
            coord[d] += 1;
            if coord[d] < t[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    Ok(map)
}

/// `[batch, d1, d2, ...]` viewed as `[batch, d1*d2*...]`.
pub(crate) fn flatten_2d(a: &NDArray) -> Result<(usize, usize)> {
    match a.dims() {
        [] | [_] => Err(Error::msg(format!(
            "expected an array with a batch axis, got shape {}",
            a.shape()
        ))),
        [batch, rest @ ..] => Ok((*batch, rest.iter().product())),
    }
}

pub(crate) fn matmul_f64(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let aip = a[i * k + p];
            if aip == 0.0 {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += aip * b[p * n + j];
            }
        }
    }
    out
}

pub(crate) fn unary_forward(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Square => x * x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Abs => x.abs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cpu() -> Context {
        Context::cpu(0)
    }

    #[test]
    fn test_copy_to_is_independent() {
        let a = NDArray::from_f64_slice(&[1.0, 2.0], 2, DType::F32, cpu()).unwrap();
        let b = a.copy_to(Context::gpu(0)).unwrap();
        assert_eq!(b.context(), Context::gpu(0));
        a.fill(9.0);
        assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, 2.0]);
        assert!(!a.shares_storage(&b));
    }

    #[test]
    fn test_astype_converts_elements() {
        let a = NDArray::from_f64_slice(&[1.7, -2.2], 2, DType::F64, cpu()).unwrap();
        let b = a.astype(DType::I32).unwrap();
        assert_eq!(b.dtype(), DType::I32);
        assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_element_count_checked() {
        let r = NDArray::from_f64_slice(&[1.0, 2.0, 3.0], (2, 2), DType::F32, cpu());
        assert!(matches!(r, Err(Error::ElementCountMismatch { expected: 4, got: 3, .. })));
    }

    #[test]
    fn test_fully_connected() {
        // x: [2, 3], w: [2, 3], b: [2]
        let x = NDArray::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, cpu())
            .unwrap();
        let w = NDArray::from_f64_slice(&[1.0, 0.0, 0.0, 0.0, 1.0, 1.0], (2, 3), DType::F64, cpu())
            .unwrap();
        let b = NDArray::from_f64_slice(&[0.5, -0.5], 2, DType::F64, cpu()).unwrap();
        let y = NDArray::fully_connected(&x, &w, Some(&b)).unwrap();
        assert_eq!(y.dims(), &[2, 2]);
        assert_eq!(y.to_f64_vec().unwrap(), vec![1.5, 4.5, 4.5, 10.5]);
    }

    #[test]
    fn test_fully_connected_rejects_wrong_in_units() {
        let x = NDArray::zeros((2, 4), DType::F32, cpu()).unwrap();
        let w = NDArray::zeros((3, 5), DType::F32, cpu()).unwrap();
        assert!(NDArray::fully_connected(&x, &w, None).is_err());
    }

    #[test]
    fn test_ops_outside_recording_are_leaves() {
        let a = NDArray::ones(3, DType::F32, cpu()).unwrap();
        let b = a.add(&a).unwrap().relu().unwrap();
        assert!(b.op().is_leaf());
        assert_relative_eq!(b.sum_all().unwrap().to_scalar().unwrap(), 6.0);
    }

    #[test]
    fn test_le_bytes_exact_for_f16() {
        let s = Storage::from_f64(DType::F16, &[0.5, -1.25, 65504.0]);
        let bytes = s.to_le_bytes();
        assert_eq!(bytes.len(), 6);
        assert_eq!(Storage::from_le_bytes(DType::F16, &bytes).unwrap(), s);
    }

    #[test]
    fn test_partial_element_bytes_rejected() {
        let err = Storage::from_le_bytes(DType::F32, &[0u8; 6]).unwrap_err();
        assert!(matches!(err, Error::Msg(ref m) if m.contains("6 bytes")));
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let a = NDArray::zeros((2, 3), DType::F32, cpu()).unwrap();
        let b = NDArray::zeros((2, 3), DType::F32, cpu()).unwrap();
        assert!(matches!(a.matmul(&b), Err(Error::Msg(ref m)) if m.contains("inner dims")));
    }

    #[test]
    fn test_fill_uniform_bounds() {
        let a = NDArray::zeros(500, DType::F64, cpu()).unwrap();
        a.fill_uniform(-0.07, 0.07).unwrap();
        assert!(a.to_f64_vec().unwrap().iter().all(|&v| (-0.07..0.07).contains(&v)));
    }
}
