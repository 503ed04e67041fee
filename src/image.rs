//! Image abstraction.
//!
//! An [`Image`] is an in-memory view over one manifest plus its referenced
//! config and layers. Backed images read their blobs from a bundle; owned
//! images are assembled from parts; mutated images are lazy compositions
//! built by [`crate::mutate::apply`]. Images are immutable once
//! constructed.
//!
//! Invariants: `manifest().layers` corresponds, in order, to `layers()`,
//! and the config's `rootfs.diff_ids` corresponds, in order, to each
//! layer's diff-id.

use bytes::Bytes;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageConfiguration, ImageManifest, MediaType,
};
use serde_json::json;

use crate::layer::{BackedLayer, Layer};
use crate::mutate::MutatedImage;
use crate::store::Bundle;
use crate::{digest, Error, Result};

/// A view over one image manifest and the blobs it references.
#[derive(Clone, Debug)]
pub enum Image {
    /// An image stored in a bundle.
    Backed(BackedImage),
    /// An image assembled in memory from a config and layers.
    Owned(OwnedImage),
    /// A lazy composition of a base image and mutations.
    Mutated(MutatedImage),
}

impl Image {
    /// Assemble an image from a raw config blob and layers. The manifest
    /// is computed: one descriptor per layer, in order, plus a config
    /// descriptor of the given media type.
    pub fn from_parts(
        raw_config: impl Into<Bytes>,
        config_media_type: MediaType,
        layers: Vec<Layer>,
        manifest_media_type: MediaType,
    ) -> Result<Image> {
        OwnedImage::from_parts(
            raw_config.into(),
            config_media_type,
            layers,
            manifest_media_type,
        )
        .map(Image::Owned)
    }

    /// Media type of this image's manifest.
    pub fn media_type(&self) -> MediaType {
        match self {
            Image::Backed(im) => im.desc.media_type().clone(),
            Image::Owned(im) => im.media_type.clone(),
            Image::Mutated(im) => im.media_type(),
        }
    }

    /// SHA-256 of this image's serialized manifest.
    pub fn digest(&self) -> Result<Digest> {
        match self {
            Image::Backed(im) => Ok(im.digest.clone()),
            Image::Owned(im) => Ok(im.digest.clone()),
            Image::Mutated(im) => im.digest(),
        }
    }

    /// Size of the serialized manifest.
    pub fn size(&self) -> Result<u64> {
        match self {
            Image::Backed(im) => Ok(im.desc.size()),
            Image::Owned(im) => Ok(im.raw_manifest.len() as u64),
            Image::Mutated(im) => im.size(),
        }
    }

    /// The serialized manifest bytes.
    pub fn raw_manifest(&self) -> Result<Bytes> {
        match self {
            Image::Backed(im) => Ok(im.raw_manifest.clone()),
            Image::Owned(im) => Ok(im.raw_manifest.clone()),
            Image::Mutated(im) => im.raw_manifest(),
        }
    }

    /// The parsed manifest.
    pub fn manifest(&self) -> Result<ImageManifest> {
        Ok(ImageManifest::from_reader(&self.raw_manifest()?[..])?)
    }

    /// The serialized config blob.
    pub fn raw_config_file(&self) -> Result<Bytes> {
        match self {
            Image::Backed(im) => im.raw_config_file(),
            Image::Owned(im) => Ok(im.raw_config.clone()),
            Image::Mutated(im) => im.raw_config_file(),
        }
    }

    /// The parsed config file. Fails with
    /// [`Error::UnexpectedConfigFileType`] when the config media type is
    /// not a standard config format.
    pub fn config_file(&self) -> Result<ImageConfiguration> {
        if let Image::Mutated(im) = self {
            return im.config_file();
        }
        Ok(ImageConfiguration::from_reader(&self.raw_config_file()?[..])?)
    }

    /// The ordered layers of this image, oldest first.
    pub fn layers(&self) -> Result<Vec<Layer>> {
        match self {
            Image::Backed(im) => im.layers(),
            Image::Owned(im) => Ok(im.layers.clone()),
            Image::Mutated(im) => im.layers(),
        }
    }

    /// Look up a layer by the digest of its compressed bytes.
    pub fn layer_by_digest(&self, digest: &Digest) -> Result<Layer> {
        match self {
            Image::Backed(im) => im.layer_by_digest(digest),
            Image::Owned(im) => im.layer_by_digest(digest),
            Image::Mutated(im) => im.layer_by_digest(digest),
        }
    }

    /// Look up a layer by the digest of its uncompressed bytes.
    pub fn layer_by_diff_id(&self, diff_id: &Digest) -> Result<Layer> {
        match self {
            Image::Backed(im) => im.layer_by_diff_id(diff_id),
            Image::Owned(im) => im.layer_by_diff_id(diff_id),
            Image::Mutated(im) => im.layer_by_diff_id(diff_id),
        }
    }

    /// Content descriptor for this image. Backed images keep the index
    /// entry they were loaded under; other variants compute one.
    pub fn descriptor(&self) -> Result<Descriptor> {
        match self {
            Image::Backed(im) => Ok(im.desc.clone()),
            _ => Ok(DescriptorBuilder::default()
                .media_type(self.media_type())
                .digest(self.digest()?)
                .size(self.size()?)
                .build()?),
        }
    }
}

/// An image whose manifest was read out of a bundle's root index.
#[derive(Clone, Debug)]
pub struct BackedImage {
    bundle: Bundle,
    desc: Descriptor,
    raw_manifest: Bytes,
    digest: Digest,
}

impl BackedImage {
    pub(crate) fn new(bundle: Bundle, desc: Descriptor, raw_manifest: Bytes) -> Self {
        let digest = digest::sha256(&raw_manifest);
        Self {
            bundle,
            desc,
            raw_manifest,
            digest,
        }
    }

    fn manifest(&self) -> Result<ImageManifest> {
        Ok(ImageManifest::from_reader(&self.raw_manifest[..])?)
    }

    fn raw_config_file(&self) -> Result<Bytes> {
        let manifest = self.manifest()?;
        Ok(self.bundle.bytes(manifest.config().digest())?.into())
    }

    fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self
            .manifest()?
            .layers()
            .iter()
            .map(|d| Layer::Backed(BackedLayer::new(self.bundle.clone(), d.clone())))
            .collect())
    }

    fn layer_by_digest(&self, digest: &Digest) -> Result<Layer> {
        for desc in self.manifest()?.layers() {
            if desc.digest() == digest {
                return Ok(Layer::Backed(BackedLayer::new(
                    self.bundle.clone(),
                    desc.clone(),
                )));
            }
        }
        Err(Error::LayerNotFound(digest.to_string()))
    }

    fn layer_by_diff_id(&self, diff_id: &Digest) -> Result<Layer> {
        let config = ImageConfiguration::from_reader(&self.raw_config_file()?[..])?;
        let wanted = diff_id.to_string();
        let position = config
            .rootfs()
            .diff_ids()
            .iter()
            .position(|id| *id == wanted)
            .ok_or_else(|| Error::LayerNotFound(wanted.clone()))?;
        let manifest = self.manifest()?;
        let desc = manifest
            .layers()
            .get(position)
            .ok_or_else(|| Error::LayerNotFound(wanted))?;
        self.layer_by_digest(desc.digest())
    }
}

/// An image assembled in memory.
#[derive(Clone, Debug)]
pub struct OwnedImage {
    media_type: MediaType,
    raw_manifest: Bytes,
    raw_config: Bytes,
    layers: Vec<Layer>,
    digest: Digest,
}

impl OwnedImage {
    fn from_parts(
        raw_config: Bytes,
        config_media_type: MediaType,
        layers: Vec<Layer>,
        manifest_media_type: MediaType,
    ) -> Result<OwnedImage> {
        let config_desc = DescriptorBuilder::default()
            .media_type(config_media_type)
            .digest(digest::sha256(&raw_config))
            .size(raw_config.len() as u64)
            .build()?;

        let mut layer_descs = Vec::with_capacity(layers.len());
        for layer in &layers {
            layer_descs.push(layer.descriptor()?);
        }

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": manifest_media_type.to_string(),
            "config": serde_json::to_value(&config_desc)?,
            "layers": serde_json::to_value(&layer_descs)?,
        });
        let raw_manifest: Bytes = serde_json::to_vec(&manifest)?.into();
        let digest = digest::sha256(&raw_manifest);

        Ok(OwnedImage {
            media_type: manifest_media_type,
            raw_manifest,
            raw_config,
            layers,
            digest,
        })
    }

    fn layer_by_digest(&self, digest: &Digest) -> Result<Layer> {
        for layer in &self.layers {
            if layer.digest()? == *digest {
                return Ok(layer.clone());
            }
        }
        Err(Error::LayerNotFound(digest.to_string()))
    }

    fn layer_by_diff_id(&self, diff_id: &Digest) -> Result<Layer> {
        for layer in &self.layers {
            if layer.diff_id()? == *diff_id {
                return Ok(layer.clone());
            }
        }
        Err(Error::LayerNotFound(diff_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn owned_image_manifest_matches_layers() {
        let img = testutil::image_with_layers(&[
            testutil::layer_tar(&[("a/", b""), ("a/foo", b"foo")]),
            testutil::layer_tar(&[("a/bar", b"bar")]),
        ]);

        let manifest = img.manifest().unwrap();
        let layers = img.layers().unwrap();
        assert_eq!(manifest.layers().len(), 2);
        for (desc, layer) in manifest.layers().iter().zip(&layers) {
            assert_eq!(*desc.digest(), layer.digest().unwrap());
            assert_eq!(desc.size(), layer.size().unwrap());
        }

        let config = img.config_file().unwrap();
        let diff_ids: Vec<String> = layers
            .iter()
            .map(|l| l.diff_id().unwrap().to_string())
            .collect();
        assert_eq!(*config.rootfs().diff_ids(), diff_ids);
    }

    #[test]
    fn image_digest_is_manifest_hash() {
        let img = testutil::image_with_layers(&[testutil::layer_tar(&[("f", b"x")])]);
        let raw = img.raw_manifest().unwrap();
        assert_eq!(img.digest().unwrap(), digest::sha256(&raw));
        assert_eq!(img.size().unwrap(), raw.len() as u64);
    }

    #[test]
    fn layer_lookup_by_digest_and_diff_id() {
        let img = testutil::image_with_layers(&[
            testutil::layer_tar(&[("a", b"1")]),
            testutil::layer_tar(&[("b", b"2")]),
        ]);
        let layers = img.layers().unwrap();

        let by_digest = img.layer_by_digest(&layers[1].digest().unwrap()).unwrap();
        assert_eq!(by_digest.digest().unwrap(), layers[1].digest().unwrap());

        let by_diff = img.layer_by_diff_id(&layers[0].diff_id().unwrap()).unwrap();
        assert_eq!(by_diff.digest().unwrap(), layers[0].digest().unwrap());

        let missing = digest::sha256(b"not a layer");
        assert!(matches!(
            img.layer_by_digest(&missing),
            Err(Error::LayerNotFound(_))
        ));
        assert!(matches!(
            img.layer_by_diff_id(&missing),
            Err(Error::LayerNotFound(_))
        ));
    }
}
