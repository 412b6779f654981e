//! Reference f32 kernels for the CPU engine.
//!
//! All tensors are flattened row-major slices; `[rows, width]` shapes are
//! passed explicitly.

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / sqrt(mean(x^2) + eps) * weight`, applied per row.
#[derive(Debug, Clone)]
pub struct RmsNorm<'a> {
    /// Scale parameter, shape `[width]`.
    pub weight: &'a [f32],
    pub eps: f32,
}

impl RmsNorm<'_> {
    /// Normalize every `[width]` row of `x`.
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let width = self.weight.len();
        let mut output = vec![0.0; x.len()];

        for (row, out) in x.chunks_exact(width).zip(output.chunks_exact_mut(width)) {
            let mean_sq: f32 = row.iter().map(|v| v * v).sum::<f32>() / width as f32;
            let inv_rms = 1.0 / (mean_sq + self.eps).sqrt();
            for ((o, &v), &w) in out.iter_mut().zip(row).zip(self.weight) {
                *o = v * inv_rms * w;
            }
        }

        output
    }
}

/// Rotary Position Embeddings with the half-split layout.
///
/// Element `j` of a head is rotated together with element `j + dim/2` by angle
/// `pos * base^(-2j/dim)`.
#[derive(Debug, Clone)]
pub struct Rope {
    pub dim: usize,
    /// Inverse frequencies: `1 / base^(2j/dim)` for `j in 0..dim/2`.
    pub inv_freq: Vec<f32>,
}

impl Rope {
    pub fn new(dim: usize, base: f32) -> Self {
        let inv_freq = (0..dim / 2)
            .map(|j| 1.0 / base.powf(2.0 * j as f32 / dim as f32))
            .collect();
        Self { dim, inv_freq }
    }

    /// Rotate `x` of shape `[seq, n_heads, dim]` in place; row `s` sits at `start_pos + s`.
    pub fn apply(&self, x: &mut [f32], n_heads: usize, start_pos: usize) {
        let half = self.dim / 2;
        for (s, row) in x.chunks_exact_mut(n_heads * self.dim).enumerate() {
            let pos = (start_pos + s) as f32;
            for head in row.chunks_exact_mut(self.dim) {
                for (j, &freq) in self.inv_freq.iter().enumerate() {
                    let (sin, cos) = (pos * freq).sin_cos();
                    let a = head[j];
                    let b = head[half + j];
                    head[j] = a * cos - b * sin;
                    head[half + j] = b * cos + a * sin;
                }
            }
        }
    }
}

/// `y = x · Wᵀ + b` for `x: [rows, in_dim]`, `W: [out_dim, in_dim]`.
pub fn linear(x: &[f32], weight: &[f32], bias: Option<&[f32]>, in_dim: usize) -> Vec<f32> {
    let out_dim = weight.len() / in_dim;
    let rows = x.len() / in_dim;
    let mut out = vec![0.0; rows * out_dim];

    for (x_row, out_row) in x.chunks_exact(in_dim).zip(out.chunks_exact_mut(out_dim)) {
        for (j, (o, w_row)) in out_row.iter_mut().zip(weight.chunks_exact(in_dim)).enumerate() {
            let dot: f32 = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
            *o = dot + bias.map_or(0.0, |b| b[j]);
        }
    }

    out
}

/// Shape parameters for [`causal_attention`].
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

/// Causal grouped-query attention.
///
/// `q` is `[qlen, n_heads, head_dim]`; `k`/`v` are `[kvlen, n_kv_heads, head_dim]`
/// and the queries are the last `qlen` of the `kvlen` positions. Query head `h`
/// reads KV head `h / (n_heads / n_kv_heads)`.
pub fn causal_attention(q: &[f32], k: &[f32], v: &[f32], shape: AttentionShape) -> Vec<f32> {
    let AttentionShape {
        n_heads,
        n_kv_heads,
        head_dim,
    } = shape;
    let q_stride = n_heads * head_dim;
    let kv_stride = n_kv_heads * head_dim;
    let qlen = q.len() / q_stride;
    let kvlen = k.len() / kv_stride;
    let group = n_heads / n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut out = vec![0.0; q.len()];
    let mut scores = vec![0.0f32; kvlen];

    for s in 0..qlen {
        let visible = kvlen - qlen + s + 1;
        for h in 0..n_heads {
            let kh = h / group;
            let q_vec = &q[s * q_stride + h * head_dim..][..head_dim];

            let mut max_score = f32::NEG_INFINITY;
            for (t, score) in scores[..visible].iter_mut().enumerate() {
                let k_vec = &k[t * kv_stride + kh * head_dim..][..head_dim];
                *score = q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum::<f32>() * scale;
                max_score = max_score.max(*score);
            }

            let mut sum = 0.0;
            for score in &mut scores[..visible] {
                *score = (*score - max_score).exp();
                sum += *score;
            }

            let y = &mut out[s * q_stride + h * head_dim..][..head_dim];
            for (t, &p) in scores[..visible].iter().enumerate() {
                let v_vec = &v[t * kv_stride + kh * head_dim..][..head_dim];
                let weight = p / sum;
                for (o, &val) in y.iter_mut().zip(v_vec) {
                    *o += weight * val;
                }
            }
        }
    }

    out
}

/// SwiGLU: `up * silu(gate)`.
pub fn swiglu(gate: &[f32], up: &[f32]) -> Vec<f32> {
    gate.iter()
        .zip(up)
        .map(|(&g, &u)| u * g / (1.0 + (-g).exp()))
        .collect()
}

/// Element-wise `acc += x`.
pub fn add_in_place(acc: &mut [f32], x: &[f32]) {
    for (a, b) in acc.iter_mut().zip(x) {
        *a += b;
    }
}
