//! Root-index reconciliation support.
//!
//! `update_root_index` walks the new index depth-first and sorts every
//! referenced blob into "keep" (already stored) or "add" (streamed into
//! a scratch directory, filename equal to the digest string). The caller
//! then deletes everything outside the keep set and appends the cached
//! blobs in recorded order, which makes blob-append order deterministic
//! across runs.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;

use crate::image::Image;
use crate::index::Index;
use crate::layer::LayerReader;
use crate::util::{check_cancel, CancelToken};
use crate::{media, Result};

/// Accumulated reconciliation decisions.
#[derive(Debug, Default)]
pub(crate) struct CachePlan {
    /// Digests to stream into the store, in reference order.
    pub(crate) added: Vec<String>,
    added_set: HashSet<String>,
    /// Digests already present that the new index still references.
    pub(crate) keep: HashSet<String>,
}

impl CachePlan {
    fn record(
        &mut self,
        digest: String,
        skip: &HashSet<String>,
        dir: &Path,
        produce: impl FnOnce() -> Result<LayerReader>,
    ) -> Result<()> {
        if skip.contains(&digest) {
            self.keep.insert(digest);
            return Ok(());
        }
        if self.added_set.contains(&digest) {
            return Ok(());
        }

        let mut file = File::create(dir.join(&digest))?;
        io::copy(&mut produce()?, &mut file)?;
        self.added_set.insert(digest.clone());
        self.added.push(digest);
        Ok(())
    }
}

/// Cache every blob referenced by `image` that is not in `skip`.
fn cache_image_blobs(
    image: &Image,
    skip: &HashSet<String>,
    dir: &Path,
    cancel: Option<&CancelToken>,
    plan: &mut CachePlan,
) -> Result<()> {
    for layer in image.layers()? {
        check_cancel(cancel)?;
        plan.record(layer.digest()?.to_string(), skip, dir, || layer.compressed())?;
    }

    let manifest = image.manifest()?;
    plan.record(manifest.config().digest().to_string(), skip, dir, || {
        Ok(Box::new(Cursor::new(image.raw_config_file()?)))
    })?;

    plan.record(image.digest()?.to_string(), skip, dir, || {
        Ok(Box::new(Cursor::new(image.raw_manifest()?)))
    })?;

    Ok(())
}

/// Cache every blob transitively referenced by `index` that is not in
/// `skip`: child indices and images first, then their manifests.
pub(crate) fn cache_index_blobs(
    index: &Index,
    skip: &HashSet<String>,
    dir: &Path,
    cancel: Option<&CancelToken>,
    plan: &mut CachePlan,
) -> Result<()> {
    for desc in index.descriptors()? {
        check_cancel(cancel)?;
        let digest = desc.digest();
        let media_type = desc.media_type();

        if media::is_image_index(media_type) {
            let child = index.index(digest)?;
            cache_index_blobs(&child, skip, dir, cancel, plan)?;
            plan.record(digest.to_string(), skip, dir, || {
                Ok(Box::new(Cursor::new(child.raw_manifest()?)))
            })?;
        } else if media::is_image_manifest(media_type) {
            let child = index.image(digest)?;
            cache_image_blobs(&child, skip, dir, cancel, plan)?;
        } else {
            plan.record(digest.to_string(), skip, dir, || index.blob(digest))?;
        }
    }

    Ok(())
}
