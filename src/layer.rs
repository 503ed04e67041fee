//! Layer abstraction.
//!
//! A [`Layer`] is a handle to one filesystem changeset: its compressed
//! bytes (identified by digest), its uncompressed bytes (identified by
//! diff-id) and a media type. Variants cover blobs backed by a bundle,
//! in-memory bytes, lazily squashed stacks and lazily converted SquashFS
//! content. Byte streams are single-pass; every call to [`Layer::compressed`]
//! or [`Layer::uncompressed`] returns a fresh reader.

use std::fmt;
use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType};
use once_cell::sync::OnceCell;

use crate::squash::SquashedLayer;
use crate::squashfs::{SquashfsLayer, TarLayer};
use crate::store::Bundle;
use crate::{digest, media, Error, Result};

/// A single-pass stream of layer bytes.
pub type LayerReader = Box<dyn Read + Send>;

/// A filesystem layer of an image.
#[derive(Clone, Debug)]
pub enum Layer {
    /// A layer whose compressed bytes live in a bundle's blob pool.
    Backed(BackedLayer),
    /// A layer owning in-memory bytes.
    Static(StaticLayer),
    /// The result of squashing a stack of layers; bytes are computed on
    /// first access and cached.
    Squashed(SquashedLayer),
    /// A tar layer converted to SquashFS format by an external converter.
    Squashfs(SquashfsLayer),
    /// A SquashFS layer converted to tar format by an external converter.
    Tar(TarLayer),
}

impl Layer {
    /// Layer over verbatim bytes: digest and diff-id are both the SHA-256
    /// of `bytes`, and both streams return them unchanged. The media type
    /// is taken at face value.
    pub fn from_bytes(bytes: impl Into<Bytes>, media_type: MediaType) -> Layer {
        Layer::Static(StaticLayer::new(bytes.into(), media_type))
    }

    /// Layer over an uncompressed tar stream. When `media_type` names a
    /// gzip-compressed format the compressed bytes are produced by gzip,
    /// otherwise they equal the input.
    pub fn from_uncompressed_tar(bytes: impl Into<Bytes>, media_type: MediaType) -> Layer {
        Layer::Static(StaticLayer::from_uncompressed_tar(bytes.into(), media_type))
    }

    /// Media type of this layer.
    pub fn media_type(&self) -> MediaType {
        match self {
            Layer::Backed(l) => l.desc.media_type().clone(),
            Layer::Static(l) => l.media_type.clone(),
            Layer::Squashed(l) => l.media_type(),
            Layer::Squashfs(l) => l.media_type(),
            Layer::Tar(l) => l.media_type(),
        }
    }

    /// Digest of the compressed bytes.
    pub fn digest(&self) -> Result<Digest> {
        match self {
            Layer::Backed(l) => Ok(l.desc.digest().clone()),
            Layer::Static(l) => Ok(l.digest.clone()),
            Layer::Squashed(l) => l.digest(),
            Layer::Squashfs(l) => l.digest(),
            Layer::Tar(l) => l.digest(),
        }
    }

    /// Digest of the uncompressed bytes.
    pub fn diff_id(&self) -> Result<Digest> {
        match self {
            Layer::Backed(l) => l.diff_id(),
            Layer::Static(l) => Ok(l.diff_id.clone()),
            Layer::Squashed(l) => l.diff_id(),
            Layer::Squashfs(l) => l.diff_id(),
            Layer::Tar(l) => l.diff_id(),
        }
    }

    /// Size of the compressed bytes.
    pub fn size(&self) -> Result<u64> {
        match self {
            Layer::Backed(l) => Ok(l.desc.size()),
            Layer::Static(l) => Ok(l.compressed.len() as u64),
            Layer::Squashed(l) => l.size(),
            Layer::Squashfs(l) => l.size(),
            Layer::Tar(l) => l.size(),
        }
    }

    /// Fresh single-pass reader over the compressed bytes.
    pub fn compressed(&self) -> Result<LayerReader> {
        match self {
            Layer::Backed(l) => l.compressed(),
            Layer::Static(l) => Ok(Box::new(Cursor::new(l.compressed.clone()))),
            Layer::Squashed(l) => l.compressed(),
            Layer::Squashfs(l) => l.reader(),
            Layer::Tar(l) => l.compressed(),
        }
    }

    /// Fresh single-pass reader over the uncompressed bytes.
    pub fn uncompressed(&self) -> Result<LayerReader> {
        match self {
            Layer::Backed(l) => l.uncompressed(),
            Layer::Static(l) => Ok(Box::new(Cursor::new(l.uncompressed.clone()))),
            Layer::Squashed(l) => l.uncompressed(),
            Layer::Squashfs(l) => l.reader(),
            Layer::Tar(l) => l.uncompressed(),
        }
    }

    /// Content descriptor for this layer. Backed layers keep the
    /// descriptor they were loaded with; other variants compute one.
    pub fn descriptor(&self) -> Result<Descriptor> {
        match self {
            Layer::Backed(l) => Ok(l.desc.clone()),
            _ => Ok(DescriptorBuilder::default()
                .media_type(self.media_type())
                .digest(self.digest()?)
                .size(self.size()?)
                .build()?),
        }
    }
}

/// A layer whose compressed bytes are stored in a bundle.
#[derive(Clone, Debug)]
pub struct BackedLayer {
    bundle: Bundle,
    desc: Descriptor,
    diff_id: OnceCell<Digest>,
}

impl BackedLayer {
    pub(crate) fn new(bundle: Bundle, desc: Descriptor) -> Self {
        Self {
            bundle,
            desc,
            diff_id: OnceCell::new(),
        }
    }

    fn compressed(&self) -> Result<LayerReader> {
        self.bundle.blob(self.desc.digest())
    }

    fn uncompressed(&self) -> Result<LayerReader> {
        let mt = self.desc.media_type();
        if media::is_gzip_layer(mt) {
            Ok(Box::new(GzDecoder::new(self.compressed()?)))
        } else if media::is_uncompressed_layer(mt) || media::is_squashfs_layer(mt) {
            self.compressed()
        } else {
            Err(Error::UnexpectedMediaType(mt.to_string()))
        }
    }

    fn diff_id(&self) -> Result<Digest> {
        let diff_id = self.diff_id.get_or_try_init(|| -> Result<Digest> {
            let (digest, _) = digest::sha256_reader(self.uncompressed()?)?;
            Ok(digest)
        })?;
        Ok(diff_id.clone())
    }
}

/// A layer owning its bytes.
#[derive(Clone)]
pub struct StaticLayer {
    media_type: MediaType,
    compressed: Bytes,
    uncompressed: Bytes,
    digest: Digest,
    diff_id: Digest,
}

impl StaticLayer {
    /// Verbatim bytes; digest and diff-id coincide.
    pub(crate) fn new(bytes: Bytes, media_type: MediaType) -> Self {
        let d = digest::sha256(&bytes);
        Self {
            media_type,
            compressed: bytes.clone(),
            uncompressed: bytes,
            digest: d.clone(),
            diff_id: d,
        }
    }

    pub(crate) fn digest(&self) -> Digest {
        self.digest.clone()
    }

    pub(crate) fn diff_id(&self) -> Digest {
        self.diff_id.clone()
    }

    pub(crate) fn size(&self) -> u64 {
        self.compressed.len() as u64
    }

    pub(crate) fn compressed_reader(&self) -> LayerReader {
        Box::new(Cursor::new(self.compressed.clone()))
    }

    pub(crate) fn uncompressed_reader(&self) -> LayerReader {
        Box::new(Cursor::new(self.uncompressed.clone()))
    }

    /// Uncompressed tar bytes; gzip media types get gzip-compressed
    /// stored bytes.
    pub(crate) fn from_uncompressed_tar(bytes: Bytes, media_type: MediaType) -> Self {
        let compressed: Bytes = if media::is_gzip_layer(&media_type) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            // Writing into a Vec cannot fail.
            encoder.write_all(&bytes).expect("gzip into memory");
            encoder.finish().expect("gzip into memory").into()
        } else {
            bytes.clone()
        };
        Self {
            media_type,
            digest: digest::sha256(&compressed),
            diff_id: digest::sha256(&bytes),
            compressed,
            uncompressed: bytes,
        }
    }
}

impl fmt::Debug for StaticLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticLayer")
            .field("media_type", &self.media_type.to_string())
            .field("digest", &self.digest.to_string())
            .field("size", &self.compressed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOOBAR_SHA256: &str =
        "sha256:c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2";

    #[test]
    fn static_layer_verbatim() {
        let layer = Layer::from_bytes(
            &b"foobar"[..],
            MediaType::Other(media::DOCKER_LAYER.to_string()),
        );
        assert_eq!(layer.digest().unwrap().to_string(), FOOBAR_SHA256);
        assert_eq!(layer.diff_id().unwrap().to_string(), FOOBAR_SHA256);
        assert_eq!(layer.size().unwrap(), 6);

        let mut compressed = Vec::new();
        layer.compressed().unwrap().read_to_end(&mut compressed).unwrap();
        assert_eq!(compressed, b"foobar");
        let mut uncompressed = Vec::new();
        layer
            .uncompressed()
            .unwrap()
            .read_to_end(&mut uncompressed)
            .unwrap();
        assert_eq!(uncompressed, b"foobar");
    }

    #[test]
    fn tar_layer_gzips_for_gzip_media_types() {
        let body = b"not really a tar stream, but enough for compression".to_vec();
        let layer = Layer::from_uncompressed_tar(body.clone(), MediaType::ImageLayerGzip);

        assert_eq!(layer.diff_id().unwrap(), digest::sha256(&body));
        assert_ne!(layer.digest().unwrap(), layer.diff_id().unwrap());

        let mut stored = Vec::new();
        layer.compressed().unwrap().read_to_end(&mut stored).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&stored[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body);
        assert_eq!(layer.size().unwrap(), stored.len() as u64);
    }

    #[test]
    fn tar_layer_passes_through_for_uncompressed_media_types() {
        let body = b"plain".to_vec();
        let layer = Layer::from_uncompressed_tar(body.clone(), MediaType::ImageLayer);
        assert_eq!(layer.digest().unwrap(), layer.diff_id().unwrap());
        let mut stored = Vec::new();
        layer.compressed().unwrap().read_to_end(&mut stored).unwrap();
        assert_eq!(stored, body);
    }

    #[test]
    fn descriptor_reflects_layer() {
        let layer = Layer::from_bytes(&b"foobar"[..], MediaType::ImageLayer);
        let desc = layer.descriptor().unwrap();
        assert_eq!(*desc.media_type(), MediaType::ImageLayer);
        assert_eq!(desc.size(), 6);
        assert_eq!(desc.digest().to_string(), FOOBAR_SHA256);
    }

    #[test]
    fn streams_are_fresh_per_call() {
        let layer = Layer::from_bytes(&b"foobar"[..], MediaType::ImageLayer);
        for _ in 0..2 {
            let mut body = Vec::new();
            layer.uncompressed().unwrap().read_to_end(&mut body).unwrap();
            assert_eq!(body, b"foobar");
        }
    }
}
