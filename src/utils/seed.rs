pub const DEFAULT_SEED: u64 = 42;

/// Seeds the MLX generator; host-side shuffling derives its RNG from the same seed.
pub fn set_random_seeds(seed: u64) -> anyhow::Result<()> {
    mlx_rs::random::seed(seed)?;
    Ok(())
}
