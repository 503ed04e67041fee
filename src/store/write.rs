//! Initial bundle write.
//!
//! A bundle is created with exactly the number of descriptors its root
//! index requires (plus any spare capacity): per image one descriptor
//! per layer plus config plus manifest; per index one per plain-blob
//! child plus the child counts plus one for the index manifest itself.
//! Blobs are written depth-first so children precede the manifests that
//! reference them.

use std::io::Cursor;

use crate::image::Image;
use crate::index::Index;
use crate::store::file::{BlobFile, KIND_OCI_BLOB, KIND_ROOT_INDEX};
use crate::{media, Result};

/// Number of descriptors required to store `image`.
fn descriptor_count_for_image(image: &Image) -> Result<u64> {
    Ok(image.layers()?.len() as u64 + 2)
}

/// Number of descriptors required to store `index`, including itself.
pub(crate) fn descriptor_count_for_index(index: &Index) -> Result<u64> {
    let mut count = 1u64;
    for desc in index.descriptors()? {
        let media_type = desc.media_type();
        if media::is_image_index(media_type) {
            count += descriptor_count_for_index(&index.index(desc.digest())?)?;
        } else if media::is_image_manifest(media_type) {
            count += descriptor_count_for_image(&index.image(desc.digest())?)?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

/// Write an image's layers, config and manifest as OCI blobs. Does not
/// touch the root index.
fn write_image(store: &mut BlobFile, image: &Image) -> Result<()> {
    for layer in image.layers()? {
        store.add_object(KIND_OCI_BLOB, layer.compressed()?)?;
    }
    let config = image.raw_config_file()?;
    store.add_object(KIND_OCI_BLOB, Cursor::new(config))?;
    let manifest = image.raw_manifest()?;
    store.add_object(KIND_OCI_BLOB, Cursor::new(manifest))?;
    Ok(())
}

/// Write an index and everything it references. The index's own manifest
/// is tagged as the root index when `root` is set.
pub(crate) fn write_index(store: &mut BlobFile, index: &Index, root: bool) -> Result<()> {
    for desc in index.descriptors()? {
        let media_type = desc.media_type();
        if media::is_image_index(media_type) {
            write_index(store, &index.index(desc.digest())?, false)?;
        } else if media::is_image_manifest(media_type) {
            write_image(store, &index.image(desc.digest())?)?;
        } else {
            let blob = index.blob(desc.digest())?;
            store.add_object(KIND_OCI_BLOB, blob)?;
        }
    }

    let raw = index.raw_manifest()?;
    let kind = if root { KIND_ROOT_INDEX } else { KIND_OCI_BLOB };
    store.add_object(kind, Cursor::new(raw))?;
    Ok(())
}
