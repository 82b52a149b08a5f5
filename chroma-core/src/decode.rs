use candle_core::Tensor;

use crate::{materialize, progress_bar, Error, LatentSize, Pipeline, Result};

/// Contiguous `[start, start + len)` slices of `0..n` of at most `batch_size` items.
pub fn sub_batches(n: usize, batch_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = batch_size.max(1);
    (0..n)
        .step_by(step)
        .map(move |start| (start, step.min(n - start)))
}

/// Decode a latent batch a few images at a time.
///
/// Every sub-batch is evaluated before the next one is requested, so peak memory is that of
/// one sub-batch. Results come back in image-index order; concatenating them along dim 0
/// gives the same batch as decoding everything at once.
pub fn decode_all<P>(
    pipeline: &mut P,
    latents: &Tensor,
    latent_size: LatentSize,
    batch_size: usize,
    show_progress: bool,
) -> Result<Vec<Tensor>>
where
    P: Pipeline + ?Sized,
{
    if batch_size == 0 {
        return Err(Error::NotPositive {
            what: "decoding batch size",
        });
    }
    let n_images = latents.dim(0)?;
    let bar = progress_bar(n_images.div_ceil(batch_size), show_progress);
    let mut decoded = Vec::with_capacity(n_images.div_ceil(batch_size));
    for (start, len) in sub_batches(n_images, batch_size) {
        let images = pipeline.decode(&latents.narrow(0, start, len)?, latent_size)?;
        materialize(&images)?;
        decoded.push(images);
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_contiguous() {
        let batches: Vec<_> = sub_batches(5, 2).collect();
        assert_eq!(batches, [(0, 2), (2, 2), (4, 1)]);
        let batches: Vec<_> = sub_batches(3, 8).collect();
        assert_eq!(batches, [(0, 3)]);
        let batches: Vec<_> = sub_batches(4, 1).collect();
        assert_eq!(batches, [(0, 1), (1, 1), (2, 1), (3, 1)]);
        assert_eq!(sub_batches(0, 4).count(), 0);
    }
}
