// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bench_infra::{rate_limited_copy, CancelToken};
use log::{info, warn};

use crate::{Error, Result};

const COPY_RETRIES: u32 = 10;
const COPY_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Boot and seed images of one VM.
#[derive(Debug, PartialEq, Eq)]
pub struct VmImages {
    pub image: PathBuf,
    pub seed: PathBuf,
    /// True when the images are private copies to be deleted at teardown.
    owned: bool,
}

impl VmImages {
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Deletes private copies. Shared images are never touched.
    pub fn remove(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.owned {
            return errors;
        }
        for path in [&self.image, &self.seed] {
            if let Err(e) = fs::remove_file(path) {
                warn!("Remove {} failed: {e}", path.display());
                errors.push(format!("remove {}: {e}", path.display()));
            }
        }
        self.owned = false;
        errors
    }
}

fn indexed_copy_path(base: &Path, index: usize) -> Result<PathBuf> {
    let name = base
        .file_name()
        .ok_or_else(|| Error::ImageMissing(base.to_path_buf()))?;
    let mut copy_name = OsString::from(format!("{index}-"));
    copy_name.push(name);
    Ok(base.with_file_name(copy_name))
}

fn copy_image(from: &Path, to: &Path, cancel: &CancelToken) -> Result<()> {
    rate_limited_copy(from, to, cancel, COPY_RETRIES, COPY_RETRY_DELAY).map_err(|source| {
        Error::ImageCopy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        }
    })?;
    Ok(())
}

/// Picks the images VM `index` boots from.
///
/// A pool of one VM boots straight from the base images. Larger pools get a
/// private copy of both images per VM, named `<index>-<file name>` next to
/// the originals.
pub fn prepare_images(
    base_image: &Path,
    base_seed: &Path,
    index: usize,
    pool_size: usize,
    cancel: &CancelToken,
) -> Result<VmImages> {
    for path in [base_image, base_seed] {
        if !path.exists() {
            return Err(Error::ImageMissing(path.to_path_buf()));
        }
    }

    if pool_size <= 1 {
        return Ok(VmImages {
            image: base_image.to_path_buf(),
            seed: base_seed.to_path_buf(),
            owned: false,
        });
    }

    let image = indexed_copy_path(base_image, index)?;
    let seed = indexed_copy_path(base_seed, index)?;

    info!("Copying {} to {}", base_image.display(), image.display());
    copy_image(base_image, &image, cancel)?;
    if let Err(e) = copy_image(base_seed, &seed, cancel) {
        let _ = fs::remove_file(&image);
        return Err(e);
    }

    Ok(VmImages {
        image,
        seed,
        owned: true,
    })
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn base_images(tmp_dir: &TempDir) -> (PathBuf, PathBuf) {
        let image = tmp_dir.as_path().join("focal.img");
        let seed = tmp_dir.as_path().join("user-data.img");
        fs::write(&image, b"boot").unwrap();
        fs::write(&seed, b"seed").unwrap();
        (image, seed)
    }

    #[test]
    fn test_single_vm_shares_images() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-img").unwrap();
        let (image, seed) = base_images(&tmp_dir);

        let mut images = prepare_images(&image, &seed, 0, 1, &CancelToken::new()).unwrap();
        assert_eq!(images.image, image);
        assert_eq!(images.seed, seed);
        assert!(!images.is_owned());

        assert!(images.remove().is_empty());
        assert!(image.exists());
        assert!(seed.exists());
    }

    #[test]
    fn test_pool_gets_private_copies() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-img").unwrap();
        let (image, seed) = base_images(&tmp_dir);

        let mut images = prepare_images(&image, &seed, 2, 3, &CancelToken::new()).unwrap();
        assert_eq!(images.image, tmp_dir.as_path().join("2-focal.img"));
        assert_eq!(images.seed, tmp_dir.as_path().join("2-user-data.img"));
        assert_eq!(fs::read(&images.image).unwrap(), b"boot");
        assert_eq!(fs::read(&images.seed).unwrap(), b"seed");

        assert!(images.remove().is_empty());
        assert!(!tmp_dir.as_path().join("2-focal.img").exists());
        assert!(!tmp_dir.as_path().join("2-user-data.img").exists());
        // Removing twice is a no-op
        assert!(images.remove().is_empty());
        assert!(image.exists());
    }

    #[test]
    fn test_missing_base_image() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-img").unwrap();
        let (image, _) = base_images(&tmp_dir);
        let seed = tmp_dir.as_path().join("nope.img");

        assert!(matches!(
            prepare_images(&image, &seed, 0, 2, &CancelToken::new()),
            Err(Error::ImageMissing(p)) if p == seed
        ));
    }
}
