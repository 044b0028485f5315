//! Sandbox artifact bundle
//!
//! Outputs leave the sandbox as one gzip'd tar of its output directory, not
//! as per-file transfers.

use crate::error::RunError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;

/// Pack the contents of `src_dir` into a .tar.gz at `bundle_path`
pub fn pack(src_dir: &Path, bundle_path: &Path) -> Result<(), RunError> {
    let file = File::create(bundle_path)
        .map_err(|e| RunError::Collect(format!("create bundle: {}", e)))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", src_dir)
        .map_err(|e| RunError::Collect(format!("pack bundle: {}", e)))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| RunError::Collect(format!("finish bundle: {}", e)))?;
    Ok(())
}

/// Extract a bundle into `dest_dir`
pub fn unpack(bundle_path: &Path, dest_dir: &Path) -> Result<(), RunError> {
    let file = File::open(bundle_path)
        .map_err(|e| RunError::Collect(format!("open bundle: {}", e)))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| RunError::Collect(format!("create extract dir: {}", e)))?;
    archive
        .unpack(dest_dir)
        .map_err(|e| RunError::Collect(format!("unpack bundle: {}", e)))?;
    Ok(())
}
