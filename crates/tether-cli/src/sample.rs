//! Random test files for exercising transfers.

use rand::RngCore;
use std::io::Write;
use std::path::Path;

const BLOCK: usize = 1024 * 1024;

/// Write `size_mb` MiB of random bytes to `path`, one MiB at a time.
pub fn write_sample_file(path: &Path, size_mb: u64) -> std::io::Result<u64> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    let mut rng = rand::thread_rng();
    let mut block = vec![0u8; BLOCK];
    for _ in 0..size_mb {
        rng.fill_bytes(&mut block);
        out.write_all(&block)?;
    }
    out.flush()?;
    Ok(size_mb * BLOCK as u64)
}
