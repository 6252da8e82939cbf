//! Shared test support: a reference interpreter over the closed operator
//! set, used to check that passes preserve program semantics.

use std::collections::HashMap;

use rheo_ir::{InsId, Op, Program};

/// Row-major strides for a dimension vector.
fn strides(dims: &[usize]) -> Vec<usize> {
    let mut s = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * dims[i + 1];
    }
    s
}

/// Decomposes a linear index into a multi-index.
fn unravel(mut lin: usize, dims: &[usize]) -> Vec<usize> {
    let s = strides(dims);
    let mut idx = vec![0; dims.len()];
    for i in 0..dims.len() {
        idx[i] = lin / s[i];
        lin %= s[i];
    }
    idx
}

/// Linear index of an operand under suffix-aligned broadcasting.
fn operand_index(out_idx: &[usize], operand_dims: &[usize]) -> usize {
    let s = strides(operand_dims);
    let skip = out_idx.len() - operand_dims.len();
    operand_dims
        .iter()
        .enumerate()
        .map(|(i, &d)| if d == 1 { 0 } else { out_idx[skip + i] * s[i] })
        .sum()
}

fn binary_op(
    out_dims: &[usize],
    lhs: (&[f32], &[usize]),
    rhs: (&[f32], &[usize]),
    f: impl Fn(f32, f32) -> f32,
) -> Vec<f32> {
    let n: usize = out_dims.iter().product();
    (0..n)
        .map(|lin| {
            let idx = unravel(lin, out_dims);
            f(
                lhs.0[operand_index(&idx, lhs.1)],
                rhs.0[operand_index(&idx, rhs.1)],
            )
        })
        .collect()
}

fn naive_conv(
    data: (&[f32], &[usize]),
    filt: (&[f32], &[usize]),
    out_dims: &[usize],
    padding: [usize; 2],
    stride: [usize; 2],
) -> Vec<f32> {
    let (dv, dd) = data;
    let (wv, wd) = filt;
    let (n, c, h, w) = (dd[0], dd[1], dd[2], dd[3]);
    let (kh, kw) = (wd[2], wd[3]);
    let (oc, oh, ow) = (out_dims[1], out_dims[2], out_dims[3]);
    let mut out = vec![0.0f32; n * oc * oh * ow];
    for bn in 0..n {
        for o in 0..oc {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f32;
                    for ci in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * stride[0] + ky) as isize - padding[0] as isize;
                                let ix = (ox * stride[1] + kx) as isize - padding[1] as isize;
                                if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                                    continue;
                                }
                                let d = dv[((bn * c + ci) * h + iy as usize) * w + ix as usize];
                                let f = wv[((o * c + ci) * kh + ky) * kw + kx];
                                acc += d * f;
                            }
                        }
                    }
                    out[((bn * oc + o) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    out
}

/// Evaluates a program as f32 tensors. `bindings` supply parameter
/// payloads by instruction id.
///
/// A split materializes the contiguous range its slice selector covers;
/// loads view that buffer at a byte offset.
#[allow(dead_code)]
pub fn eval(prog: &Program, bindings: &HashMap<InsId, Vec<f32>>) -> HashMap<InsId, Vec<f32>> {
    let mut vals: HashMap<InsId, Vec<f32>> = HashMap::new();
    for id in prog.iter() {
        let ins = &prog[id];
        let v = match &ins.op {
            Op::Literal => ins.lit.as_ref().expect("literal payload").as_f32s(),
            Op::Param { .. } => bindings
                .get(&id)
                .unwrap_or_else(|| panic!("missing binding for parameter {id:?}"))
                .clone(),
            Op::Add | Op::Mul => {
                let (a, b) = (ins.inputs[0], ins.inputs[1]);
                let f: fn(f32, f32) -> f32 = if matches!(ins.op, Op::Add) {
                    |x, y| x + y
                } else {
                    |x, y| x * y
                };
                binary_op(
                    &ins.shape.dims,
                    (&vals[&a], &prog[a].shape.dims),
                    (&vals[&b], &prog[b].shape.dims),
                    f,
                )
            }
            Op::Relu => vals[&ins.inputs[0]].iter().map(|v| v.max(0.0)).collect(),
            Op::Broadcast { axis, .. } => {
                let input = ins.inputs[0];
                let in_dims = &prog[input].shape.dims;
                let out_dims = &ins.shape.dims;
                let iv = &vals[&input];
                let is = strides(in_dims);
                let n: usize = out_dims.iter().product();
                (0..n)
                    .map(|lin| {
                        let idx = unravel(lin, out_dims);
                        let off: usize = (0..in_dims.len()).map(|i| idx[axis + i] * is[i]).sum();
                        iv[off]
                    })
                    .collect()
            }
            Op::Concat { axis } => {
                let out_dims = &ins.shape.dims;
                let leading: usize = out_dims[..*axis].iter().product();
                let mut out = Vec::with_capacity(out_dims.iter().product());
                for s in 0..leading {
                    for &input in &ins.inputs {
                        let dims = &prog[input].shape.dims;
                        let chunk: usize = dims[*axis..].iter().product();
                        out.extend_from_slice(&vals[&input][s * chunk..(s + 1) * chunk]);
                    }
                }
                out
            }
            Op::Split {
                axis,
                slice_dims,
                slice_selector: (first, last),
            } => {
                let input = ins.inputs[0];
                let in_dims = &prog[input].shape.dims;
                let iv = &vals[&input];
                let leading: usize = in_dims[..*axis].iter().product();
                let trailing: usize = in_dims[*axis + 1..].iter().product();
                let start = slice_dims[..*first].iter().sum::<usize>() * trailing;
                let width = slice_dims[*first..=*last].iter().sum::<usize>() * trailing;
                let full = in_dims[*axis] * trailing;
                let mut out = Vec::with_capacity(leading * width);
                for s in 0..leading {
                    out.extend_from_slice(&iv[s * full + start..s * full + start + width]);
                }
                out
            }
            Op::Load { shape, byte_offset } => {
                assert_eq!(byte_offset % 4, 0);
                let start = byte_offset / 4;
                vals[&ins.inputs[0]][start..start + shape.elements()].to_vec()
            }
            Op::Reshape { .. } => vals[&ins.inputs[0]].clone(),
            Op::Convolution { padding, stride } => {
                let (d, w) = (ins.inputs[0], ins.inputs[1]);
                naive_conv(
                    (&vals[&d], &prog[d].shape.dims),
                    (&vals[&w], &prog[w].shape.dims),
                    &ins.shape.dims,
                    *padding,
                    *stride,
                )
            }
            // Opaque operators pass their first operand through.
            Op::Custom { .. } => vals[&ins.inputs[0]].clone(),
        };
        vals.insert(id, v);
    }
    vals
}

/// Deterministic pseudo-random payload for test tensors.
#[allow(dead_code)]
pub fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i * 37 + 11) % 23) as f32 * scale - 5.0)
        .collect()
}

/// The ids of all instructions carrying the given operator name.
#[allow(dead_code)]
pub fn find_by_name(prog: &Program, name: &str) -> Vec<InsId> {
    prog.iter().filter(|&id| prog[id].name() == name).collect()
}
