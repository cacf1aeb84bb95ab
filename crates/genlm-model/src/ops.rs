//! Reference kernels for the decoder.
//!
//! All tensors are flattened row-major `f32` slices. Weight matrices are
//! stored `[in_dim, out_dim]` so a projection is `x @ W`.

use crate::{ModelError, ModelResult};

fn check_len(op: &'static str, expected: usize, got: usize) -> ModelResult<()> {
    if expected != got {
        return Err(ModelError::ShapeMismatch { op, expected, got });
    }
    Ok(())
}

/// Matrix-vector multiply: x @ W where W is [in_dim, out_dim] row-major.
pub fn matvec(x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) -> ModelResult<Vec<f32>> {
    check_len("matvec input", in_dim, x.len())?;
    check_len("matvec weight", in_dim * out_dim, w.len())?;

    let mut out = vec![0.0f32; out_dim];
    for (&x_j, row) in x.iter().zip(w.chunks_exact(out_dim)) {
        for (acc, &w_ji) in out.iter_mut().zip(row) {
            *acc += x_j * w_ji;
        }
    }
    Ok(out)
}

/// Element-wise `a + b`.
pub fn add(a: &[f32], b: &[f32]) -> ModelResult<Vec<f32>> {
    check_len("residual add", a.len(), b.len())?;
    Ok(a.iter().zip(b).map(|(x, y)| x + y).collect())
}

/// Root Mean Square Layer Normalization of a single vector.
///
/// `y = x / sqrt(mean(x^2) + eps) * weight`
pub fn rms_norm(x: &[f32], weight: &[f32], eps: f32) -> ModelResult<Vec<f32>> {
    check_len("rms_norm", weight.len(), x.len())?;

    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len().max(1) as f32;
    let rms = (mean_sq + eps).sqrt();
    Ok(x.iter().zip(weight).map(|(&v, &w)| (v / rms) * w).collect())
}

/// Rotary position embeddings applied in place to one position's Q and K.
///
/// Each head's `(x[2i], x[2i+1])` pair is rotated by `position * base^(-2i/head_dim)`.
pub fn apply_rope(
    q: &mut [f32],
    k: &mut [f32],
    position: usize,
    n_heads: usize,
    head_dim: usize,
    base: f32,
) -> ModelResult<()> {
    let width = n_heads * head_dim;
    check_len("rope q", width, q.len())?;
    check_len("rope k", width, k.len())?;
    if head_dim % 2 != 0 {
        return Err(ModelError::InvalidConfig(format!(
            "head_dim {head_dim} must be even for RoPE"
        )));
    }

    let pos = position as f32;
    for i in 0..head_dim / 2 {
        let inv_freq = 1.0 / base.powf(2.0 * i as f32 / head_dim as f32);
        let (sin, cos) = (pos * inv_freq).sin_cos();

        for h in 0..n_heads {
            let idx = h * head_dim + 2 * i;
            for x in [&mut *q, &mut *k] {
                let (x0, x1) = (x[idx], x[idx + 1]);
                x[idx] = x0 * cos - x1 * sin;
                x[idx + 1] = x0 * sin + x1 * cos;
            }
        }
    }

    Ok(())
}

/// Multi-head attention of one query against `seq_len` cached positions.
///
/// `keys` and `values` are `[seq_len, n_heads, head_dim]`.
pub fn attention_decode(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    seq_len: usize,
    n_heads: usize,
    head_dim: usize,
) -> ModelResult<Vec<f32>> {
    let width = n_heads * head_dim;
    check_len("attention q", width, q.len())?;
    check_len("attention keys", seq_len * width, keys.len())?;
    check_len("attention values", seq_len * width, values.len())?;
    if seq_len == 0 {
        return Err(ModelError::ShapeMismatch {
            op: "attention context",
            expected: 1,
            got: 0,
        });
    }

    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0f32; width];
    let mut scores = vec![0.0f32; seq_len];

    for h in 0..n_heads {
        let head = h * head_dim..(h + 1) * head_dim;
        let q_h = &q[head.clone()];

        for (t, score) in scores.iter_mut().enumerate() {
            let k_t = &keys[t * width + head.start..t * width + head.end];
            *score = q_h.iter().zip(k_t).map(|(a, b)| a * b).sum::<f32>() * scale;
        }

        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f32;
        for score in scores.iter_mut() {
            *score = (*score - max).exp();
            denom += *score;
        }

        let out_h = &mut out[head.clone()];
        for (t, &weight) in scores.iter().enumerate() {
            let v_t = &values[t * width + head.start..t * width + head.end];
            let p = weight / denom;
            for (o, &v) in out_h.iter_mut().zip(v_t) {
                *o += p * v;
            }
        }
    }

    Ok(out)
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// SwiGLU feedforward: `(silu(x @ W_gate) * (x @ W_up)) @ W_down`.
pub fn mlp_swiglu(
    x: &[f32],
    w_gate: &[f32],
    w_up: &[f32],
    w_down: &[f32],
    d_model: usize,
    d_ff: usize,
) -> ModelResult<Vec<f32>> {
    let gate = matvec(x, w_gate, d_model, d_ff)?;
    let up = matvec(x, w_up, d_model, d_ff)?;
    let hidden: Vec<f32> = gate.iter().zip(&up).map(|(&g, &u)| silu(g) * u).collect();
    matvec(&hidden, w_down, d_ff, d_model)
}
