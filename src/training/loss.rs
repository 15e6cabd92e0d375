//! Loss functions for contrastive and supervised objectives

use candle_core::Tensor;

use crate::error::Result;

/// L2-normalize rows of a `(B, D)` tensor
fn l2_normalize(t: &Tensor) -> Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(t.broadcast_div(&(norm + 1e-12)?)?)
}

/// Normalized-temperature cross-entropy contrastive loss.
///
/// The batch's two views form `2N` embeddings; row `i` and row `(i + N) % 2N`
/// are the positive pair and every other row is a negative. The masked
/// similarity matrix feeds a cross-entropy that covers both directions of
/// each pair, so the loss is symmetric by construction.
pub struct NtXent {
    temperature: f64,
}

impl NtXent {
    /// Create the loss with a positive temperature
    pub fn new(temperature: f64) -> Self {
        Self { temperature }
    }

    /// Contrastive loss over matched projection batches `z_i`, `z_j` of shape `(N, D)`
    pub fn forward(&self, z_i: &Tensor, z_j: &Tensor) -> Result<Tensor> {
        let n = z_i.dim(0)?;
        let m = 2 * n;
        let device = z_i.device();

        let z = Tensor::cat(&[z_i, z_j], 0)?;
        let z = l2_normalize(&z)?;
        let sim = (z.matmul(&z.t()?)? / self.temperature)?;

        // self-similarity must never win the softmax
        let mut mask = vec![0.0f32; m * m];
        for i in 0..m {
            mask[i * m + i] = -1e9;
        }
        let mask = Tensor::from_vec(mask, (m, m), device)?;
        let logits = (sim + mask)?;

        let targets: Vec<u32> = (0..m).map(|i| ((i + n) % m) as u32).collect();
        let targets = Tensor::from_vec(targets, (m,), device)?;

        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }
}

/// Multi-label binary cross-entropy with logits, numerically stable form:
/// `max(x, 0) - x*y + ln(1 + exp(-|x|))`, averaged over all elements.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let zeros = logits.zeros_like()?;
    let hinge = logits.maximum(&zeros)?;
    let product = (logits * targets)?;
    let softplus = ((logits.abs()?.neg()?.exp()? + 1.0)?).log()?;
    let loss = ((hinge - product)? + softplus)?;
    Ok(loss.mean_all()?)
}
