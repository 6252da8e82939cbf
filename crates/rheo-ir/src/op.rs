//! Operators and shape inference.

use std::fmt;

use crate::error::IrError;
use crate::shape::Shape;

/// An operator with its typed parameters.
///
/// The variant set is closed over what the optimization passes inspect;
/// arbitrary operators flow through as [`Op::Custom`] and are costed by
/// name.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Constant marker; the instruction carries a literal payload.
    Literal,
    /// Graph input leaf with a fixed shape.
    Param { shape: Shape },
    /// Expand the input along `axis` into `out_shape`.
    ///
    /// The output shape is embedded in the operator, so a pass that widens
    /// the input must rebuild the operator as well.
    Broadcast { axis: usize, out_shape: Shape },
    /// Concatenate the inputs along `axis`.
    Concat { axis: usize },
    /// Expose slices of the input along `axis`.
    ///
    /// `slice_dims` holds the length of every slice along `axis`;
    /// `slice_selector` is the inclusive range of slice indices this
    /// instruction still covers.
    Split {
        axis: usize,
        slice_dims: Vec<usize>,
        slice_selector: (usize, usize),
    },
    /// View `shape` at `byte_offset` into the producer's allocation.
    Load { shape: Shape, byte_offset: usize },
    /// Reinterpret the input with new dimensions.
    Reshape { dims: Vec<usize> },
    /// 2-D convolution over NCHW data with OIHW filters.
    Convolution {
        padding: [usize; 2],
        stride: [usize; 2],
    },
    Add,
    Mul,
    Relu,
    /// An operator the core does not interpret beyond its name.
    Custom { name: String },
}

impl Op {
    /// The operator name string.
    pub fn name(&self) -> &str {
        match self {
            Self::Literal => "@literal",
            Self::Param { .. } => "@param",
            Self::Broadcast { .. } => "broadcast",
            Self::Concat { .. } => "concat",
            Self::Split { .. } => "split",
            Self::Load { .. } => "load",
            Self::Reshape { .. } => "reshape",
            Self::Convolution { .. } => "convolution",
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Relu => "relu",
            Self::Custom { name } => name,
        }
    }

    /// Infer the result shape from the operand shapes.
    pub fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape, IrError> {
        match self {
            Self::Literal => Err(IrError::InvalidOperands {
                op: self.name().into(),
                reason: "shape is carried by the literal payload".into(),
            }),
            Self::Param { shape } => {
                expect_arity(self, inputs, 0)?;
                Ok(shape.clone())
            }
            Self::Broadcast { axis, out_shape } => {
                expect_arity(self, inputs, 1)?;
                let b = &inputs[0];
                if *axis + b.ndim() > out_shape.ndim() {
                    return Err(IrError::AxisOutOfRange {
                        op: self.name().into(),
                        axis: *axis,
                        rank: out_shape.ndim(),
                    });
                }
                for (i, &d) in b.dims.iter().enumerate() {
                    if out_shape.dims[*axis + i] != d {
                        return Err(IrError::ShapeMismatch {
                            op: self.name().into(),
                            lhs: b.clone(),
                            rhs: out_shape.clone(),
                        });
                    }
                }
                Ok(Shape::new(b.elem, out_shape.dims.clone()))
            }
            Self::Concat { axis } => {
                if inputs.is_empty() {
                    return Err(IrError::Arity {
                        op: self.name().into(),
                        expected: 1,
                        found: 0,
                    });
                }
                let first = &inputs[0];
                if *axis >= first.ndim() {
                    return Err(IrError::AxisOutOfRange {
                        op: self.name().into(),
                        axis: *axis,
                        rank: first.ndim(),
                    });
                }
                let mut dims = first.dims.clone();
                for s in &inputs[1..] {
                    if s.ndim() != first.ndim()
                        || s.dims
                            .iter()
                            .enumerate()
                            .any(|(i, &d)| i != *axis && d != first.dims[i])
                    {
                        return Err(IrError::ShapeMismatch {
                            op: self.name().into(),
                            lhs: first.clone(),
                            rhs: s.clone(),
                        });
                    }
                    dims[*axis] += s.dims[*axis];
                }
                Ok(Shape::new(first.elem, dims))
            }
            Self::Split {
                axis,
                slice_dims,
                slice_selector: (first, last),
            } => {
                expect_arity(self, inputs, 1)?;
                let input = &inputs[0];
                if *axis >= input.ndim() {
                    return Err(IrError::AxisOutOfRange {
                        op: self.name().into(),
                        axis: *axis,
                        rank: input.ndim(),
                    });
                }
                if first > last || *last >= slice_dims.len() {
                    return Err(IrError::InvalidOperands {
                        op: self.name().into(),
                        reason: format!(
                            "slice selector {first}..={last} outside {} slices",
                            slice_dims.len()
                        ),
                    });
                }
                let mut dims = input.dims.clone();
                dims[*axis] = slice_dims[*first..=*last].iter().sum();
                Ok(Shape::new(input.elem, dims))
            }
            Self::Load { shape, .. } => {
                expect_arity(self, inputs, 1)?;
                Ok(shape.clone())
            }
            Self::Reshape { dims } => {
                expect_arity(self, inputs, 1)?;
                let input = &inputs[0];
                if dims.iter().product::<usize>() != input.elements() {
                    return Err(IrError::InvalidOperands {
                        op: self.name().into(),
                        reason: format!("cannot reshape {input} into {dims:?}"),
                    });
                }
                Ok(Shape::new(input.elem, dims.clone()))
            }
            Self::Convolution { padding, stride } => {
                expect_arity(self, inputs, 2)?;
                let (data, filt) = (&inputs[0], &inputs[1]);
                if data.ndim() != 4 || filt.ndim() != 4 {
                    return Err(IrError::InvalidOperands {
                        op: self.name().into(),
                        reason: format!("expected rank-4 operands, found {data} and {filt}"),
                    });
                }
                if data.dims[1] != filt.dims[1] {
                    return Err(IrError::ShapeMismatch {
                        op: self.name().into(),
                        lhs: data.clone(),
                        rhs: filt.clone(),
                    });
                }
                let mut dims = vec![data.dims[0], filt.dims[0], 0, 0];
                for i in 0..2 {
                    let padded = data.dims[2 + i] + 2 * padding[i];
                    if filt.dims[2 + i] > padded {
                        return Err(IrError::InvalidOperands {
                            op: self.name().into(),
                            reason: format!("filter {filt} larger than padded input {data}"),
                        });
                    }
                    dims[2 + i] = (padded - filt.dims[2 + i]) / stride[i] + 1;
                }
                Ok(Shape::new(data.elem, dims))
            }
            Self::Add | Self::Mul => {
                expect_arity(self, inputs, 2)?;
                broadcast_dims(self.name(), &inputs[0], &inputs[1])
            }
            Self::Relu => {
                expect_arity(self, inputs, 1)?;
                Ok(inputs[0].clone())
            }
            Self::Custom { .. } => {
                if inputs.is_empty() {
                    return Err(IrError::Arity {
                        op: self.name().into(),
                        expected: 1,
                        found: 0,
                    });
                }
                Ok(inputs[0].clone())
            }
        }
    }
}

fn expect_arity(op: &Op, inputs: &[Shape], expected: usize) -> Result<(), IrError> {
    if inputs.len() != expected {
        return Err(IrError::Arity {
            op: op.name().into(),
            expected,
            found: inputs.len(),
        });
    }
    Ok(())
}

/// Multidirectional (suffix-aligned) elementwise broadcasting.
fn broadcast_dims(op: &str, lhs: &Shape, rhs: &Shape) -> Result<Shape, IrError> {
    let rank = lhs.ndim().max(rhs.ndim());
    let mut dims = vec![0; rank];
    for i in 0..rank {
        let a = lhs.dims.get(lhs.ndim().wrapping_sub(rank - i)).copied();
        let b = rhs.dims.get(rhs.ndim().wrapping_sub(rank - i)).copied();
        dims[i] = match (a, b) {
            (Some(a), Some(b)) if a == b => a,
            (Some(1), Some(b)) => b,
            (Some(a), Some(1)) => a,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            _ => {
                return Err(IrError::ShapeMismatch {
                    op: op.into(),
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        };
    }
    Ok(Shape::new(lhs.elem, dims))
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast { axis, .. } => write!(f, "broadcast[axis={axis}]"),
            Self::Concat { axis } => write!(f, "concat[axis={axis}]"),
            Self::Split {
                axis,
                slice_dims,
                slice_selector: (first, last),
            } => write!(f, "split[axis={axis},dims={slice_dims:?},range={first}..={last}]"),
            Self::Load { shape, byte_offset } => {
                write!(f, "load[shape={shape},offset={byte_offset}]")
            }
            Self::Reshape { dims } => write!(f, "reshape[dims={dims:?}]"),
            Self::Convolution { padding, stride } => {
                write!(f, "convolution[padding={padding:?},stride={stride:?}]")
            }
            other => f.write_str(other.name()),
        }
    }
}
