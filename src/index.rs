//! Image-index abstraction.
//!
//! An [`Index`] is a manifest list referencing images and sub-indices by
//! digest. Backed indices read their children out of a bundle; owned
//! indices are edited copies (append / remove / annotation changes) that
//! resolve unknown digests through the index they were derived from.
//!
//! Index manifests are opaque JSON to this crate: edits touch only the
//! `manifests` array and entry annotations, so unknown fields survive.

use std::collections::HashMap;

use bytes::Bytes;
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, ImageIndex, MediaType};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};

use crate::image::{BackedImage, Image};
use crate::layer::LayerReader;
use crate::select::REF_NAME_ANNOTATION;
use crate::store::Bundle;
use crate::{digest, media, Error, Result};

const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// A manifest list referencing images and sub-indices by digest.
#[derive(Clone, Debug)]
pub enum Index {
    /// An index stored in a bundle.
    Backed(BackedIndex),
    /// An edited or assembled index.
    Owned(OwnedIndex),
}

/// An item referenced by an index entry.
#[derive(Clone, Debug)]
pub enum IndexChild {
    Image(Image),
    Index(Index),
}

impl IndexChild {
    pub(crate) fn descriptor(&self) -> Result<Descriptor> {
        match self {
            IndexChild::Image(image) => image.descriptor(),
            IndexChild::Index(index) => index.descriptor(),
        }
    }

    fn digest(&self) -> Result<Digest> {
        match self {
            IndexChild::Image(image) => image.digest(),
            IndexChild::Index(index) => index.digest(),
        }
    }
}

impl Index {
    /// An empty OCI image index.
    pub fn empty() -> Index {
        Index::Owned(OwnedIndex {
            value: json!({
                "schemaVersion": 2,
                "mediaType": OCI_INDEX_MEDIA_TYPE,
                "manifests": [],
            }),
            children: HashMap::new(),
            base: None,
            cache: OnceCell::new(),
        })
    }

    /// Media type of this index's manifest.
    pub fn media_type(&self) -> MediaType {
        match self {
            Index::Backed(ix) => ix.desc.media_type().clone(),
            Index::Owned(ix) => match ix.value.get("mediaType").and_then(Value::as_str) {
                Some(OCI_INDEX_MEDIA_TYPE) | None => MediaType::ImageIndex,
                Some(other) => MediaType::Other(other.to_string()),
            },
        }
    }

    /// SHA-256 of the serialized index manifest.
    pub fn digest(&self) -> Result<Digest> {
        match self {
            Index::Backed(ix) => Ok(ix.digest.clone()),
            Index::Owned(ix) => Ok(ix.serialized()?.1.clone()),
        }
    }

    /// Size of the serialized index manifest.
    pub fn size(&self) -> Result<u64> {
        Ok(self.raw_manifest()?.len() as u64)
    }

    /// The serialized index manifest bytes.
    pub fn raw_manifest(&self) -> Result<Bytes> {
        match self {
            Index::Backed(ix) => Ok(ix.raw.clone()),
            Index::Owned(ix) => Ok(ix.serialized()?.0.clone()),
        }
    }

    /// The parsed index manifest.
    pub fn manifest(&self) -> Result<ImageIndex> {
        Ok(ImageIndex::from_reader(&self.raw_manifest()?[..])?)
    }

    /// The descriptors of this index's direct children, in order.
    pub fn descriptors(&self) -> Result<Vec<Descriptor>> {
        Ok(self.manifest()?.manifests().clone())
    }

    /// Content descriptor for this index. Backed indices keep the entry
    /// they were loaded under; owned indices compute one.
    pub fn descriptor(&self) -> Result<Descriptor> {
        match self {
            Index::Backed(ix) => Ok(ix.desc.clone()),
            Index::Owned(_) => Ok(DescriptorBuilder::default()
                .media_type(self.media_type())
                .digest(self.digest()?)
                .size(self.size()?)
                .build()?),
        }
    }

    fn find_descriptor(&self, digest: &Digest) -> Result<Descriptor> {
        self.descriptors()?
            .into_iter()
            .find(|d| d.digest() == digest)
            .ok_or_else(|| Error::DescriptorNotFound(digest.to_string()))
    }

    /// The referenced image with the given digest.
    pub fn image(&self, digest: &Digest) -> Result<Image> {
        let desc = self.find_descriptor(digest)?;
        if !media::is_image_manifest(desc.media_type()) {
            return Err(Error::UnexpectedMediaType(desc.media_type().to_string()));
        }

        match self {
            Index::Backed(ix) => {
                let raw: Bytes = ix.bundle.bytes(digest)?.into();
                Ok(Image::Backed(BackedImage::new(ix.bundle.clone(), desc, raw)))
            }
            Index::Owned(ix) => match ix.children.get(&digest.to_string()) {
                Some(IndexChild::Image(image)) => Ok(image.clone()),
                Some(IndexChild::Index(_)) => {
                    Err(Error::UnexpectedMediaType(desc.media_type().to_string()))
                }
                None => match &ix.base {
                    Some(base) => base.image(digest),
                    None => Err(Error::DescriptorNotFound(digest.to_string())),
                },
            },
        }
    }

    /// The referenced sub-index with the given digest.
    pub fn index(&self, digest: &Digest) -> Result<Index> {
        let desc = self.find_descriptor(digest)?;
        if !media::is_image_index(desc.media_type()) {
            return Err(Error::UnexpectedMediaType(desc.media_type().to_string()));
        }

        match self {
            Index::Backed(ix) => {
                let raw: Bytes = ix.bundle.bytes(digest)?.into();
                Ok(Index::Backed(BackedIndex::new(ix.bundle.clone(), desc, raw)))
            }
            Index::Owned(ix) => match ix.children.get(&digest.to_string()) {
                Some(IndexChild::Index(index)) => Ok(index.clone()),
                Some(IndexChild::Image(_)) => {
                    Err(Error::UnexpectedMediaType(desc.media_type().to_string()))
                }
                None => match &ix.base {
                    Some(base) => base.index(digest),
                    None => Err(Error::DescriptorNotFound(digest.to_string())),
                },
            },
        }
    }

    /// A stream over the raw bytes of a referenced blob. Used for index
    /// entries that are neither images nor sub-indices.
    pub fn blob(&self, digest: &Digest) -> Result<LayerReader> {
        match self {
            Index::Backed(ix) => ix.bundle.blob(digest),
            Index::Owned(ix) => {
                for child in ix.children.values() {
                    if let IndexChild::Image(image) = child {
                        if let Ok(layer) = image.layer_by_digest(digest) {
                            return layer.compressed();
                        }
                    }
                }
                match &ix.base {
                    Some(base) => base.blob(digest),
                    None => Err(Error::BlobRead(digest.to_string())),
                }
            }
        }
    }

    /// A new index with `child` appended as a fresh entry. Extra
    /// annotations are merged over the child's own descriptor
    /// annotations.
    pub fn append(
        &self,
        child: IndexChild,
        extra_annotations: Option<HashMap<String, String>>,
    ) -> Result<Index> {
        let desc = child.descriptor()?;
        let mut annotations = desc.annotations().clone().unwrap_or_default();
        if let Some(extra) = extra_annotations {
            annotations.extend(extra);
        }

        let mut item = serde_json::to_value(&desc)?;
        let obj = item
            .as_object_mut()
            .ok_or_else(|| Error::BlobRead("descriptor is not an object".into()))?;
        if annotations.is_empty() {
            obj.remove("annotations");
        } else {
            obj.insert("annotations".to_string(), serde_json::to_value(&annotations)?);
        }

        let mut value = self.owned_value()?;
        manifests_mut(&mut value)?.push(item);

        let mut children = self.owned_children();
        children.insert(child.digest()?.to_string(), child);

        Ok(Index::Owned(OwnedIndex {
            value,
            children,
            base: Some(Box::new(self.clone())),
            cache: OnceCell::new(),
        }))
    }

    /// A new index without the entries selected by `matcher`.
    pub fn remove_matching(&self, matcher: impl Fn(&Descriptor) -> bool) -> Result<Index> {
        let mut value = self.owned_value()?;
        let manifests = manifests_mut(&mut value)?;
        let mut kept = Vec::with_capacity(manifests.len());
        for item in manifests.drain(..) {
            let desc: Descriptor = serde_json::from_value(item.clone())?;
            if !matcher(&desc) {
                kept.push(item);
            }
        }
        *manifests = kept;

        Ok(Index::Owned(OwnedIndex {
            value,
            children: self.owned_children(),
            base: Some(Box::new(self.clone())),
            cache: OnceCell::new(),
        }))
    }

    /// A new index where an entry carrying the given reference-name
    /// annotation loses it and moves to the end, under its existing
    /// digest. More than one matching entry is an error; none is a
    /// no-op.
    pub(crate) fn strip_ref_name(&self, name: &str) -> Result<Index> {
        let descriptors = self.descriptors()?;
        let matches: Vec<usize> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .is_some_and(|v| v == name)
            })
            .map(|(i, _)| i)
            .collect();

        if matches.len() > 1 {
            return Err(Error::MultipleRefNames);
        }
        let Some(&index) = matches.first() else {
            return Ok(self.clone());
        };

        let mut value = self.owned_value()?;
        let manifests = manifests_mut(&mut value)?;
        let mut item = manifests.remove(index);
        let mut drop_annotations = false;
        if let Some(annotations) = item.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove(REF_NAME_ANNOTATION);
            drop_annotations = annotations.is_empty();
        }
        if drop_annotations {
            if let Some(obj) = item.as_object_mut() {
                obj.remove("annotations");
            }
        }
        manifests.push(item);

        Ok(Index::Owned(OwnedIndex {
            value,
            children: self.owned_children(),
            base: Some(Box::new(self.clone())),
            cache: OnceCell::new(),
        }))
    }

    fn owned_value(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.raw_manifest()?)?)
    }

    fn owned_children(&self) -> HashMap<String, IndexChild> {
        match self {
            Index::Backed(_) => HashMap::new(),
            Index::Owned(ix) => ix.children.clone(),
        }
    }
}

fn manifests_mut(value: &mut Value) -> Result<&mut Vec<Value>> {
    value
        .get_mut("manifests")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::BlobRead("index manifest has no manifests array".into()))
}

/// An index whose manifest was read out of a bundle.
#[derive(Clone, Debug)]
pub struct BackedIndex {
    bundle: Bundle,
    desc: Descriptor,
    raw: Bytes,
    digest: Digest,
}

impl BackedIndex {
    pub(crate) fn new(bundle: Bundle, desc: Descriptor, raw: Bytes) -> Self {
        let digest = digest::sha256(&raw);
        Self {
            bundle,
            desc,
            raw,
            digest,
        }
    }
}

/// An edited or assembled index.
#[derive(Clone, Debug)]
pub struct OwnedIndex {
    value: Value,
    children: HashMap<String, IndexChild>,
    base: Option<Box<Index>>,
    cache: OnceCell<(Bytes, Digest)>,
}

impl OwnedIndex {
    fn serialized(&self) -> Result<&(Bytes, Digest)> {
        self.cache.get_or_try_init(|| {
            let raw: Bytes = serde_json::to_vec(&self.value)?.into();
            let digest = digest::sha256(&raw);
            Ok((raw, digest))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn sample_image() -> Image {
        testutil::image_with_layers(&[testutil::layer_tar(&[("f", b"x")])])
    }

    #[test]
    fn empty_index() {
        let index = Index::empty();
        assert_eq!(index.media_type(), MediaType::ImageIndex);
        assert!(index.descriptors().unwrap().is_empty());
        assert_eq!(index.digest().unwrap(), digest::sha256(&index.raw_manifest().unwrap()));
    }

    #[test]
    fn append_and_look_up_image() {
        let image = sample_image();
        let mut annotations = HashMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), "myimage:v1".to_string());

        let index = Index::empty()
            .append(IndexChild::Image(image.clone()), Some(annotations))
            .unwrap();

        let descriptors = index.descriptors().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(*descriptors[0].digest(), image.digest().unwrap());
        assert_eq!(
            descriptors[0]
                .annotations()
                .as_ref()
                .unwrap()
                .get(REF_NAME_ANNOTATION)
                .unwrap(),
            "myimage:v1"
        );

        let looked_up = index.image(&image.digest().unwrap()).unwrap();
        assert_eq!(looked_up.digest().unwrap(), image.digest().unwrap());

        // Looking it up as an index is a media-type error.
        assert!(matches!(
            index.index(&image.digest().unwrap()),
            Err(Error::UnexpectedMediaType(_))
        ));
    }

    #[test]
    fn strip_ref_name_moves_entry_to_end() {
        let first = sample_image();
        let second = testutil::image_with_layers(&[testutil::layer_tar(&[("g", b"y")])]);

        let mut annotations = HashMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), "tag".to_string());

        let index = Index::empty()
            .append(IndexChild::Image(first.clone()), Some(annotations.clone()))
            .unwrap();
        let index = index.strip_ref_name("tag").unwrap();
        let index = index
            .append(IndexChild::Image(second.clone()), Some(annotations))
            .unwrap();

        let descriptors = index.descriptors().unwrap();
        assert_eq!(descriptors.len(), 2);

        // The displaced entry kept its digest but lost the annotation.
        assert_eq!(*descriptors[0].digest(), first.digest().unwrap());
        assert!(descriptors[0].annotations().is_none());

        // The new entry carries it.
        assert_eq!(*descriptors[1].digest(), second.digest().unwrap());
        assert_eq!(
            descriptors[1]
                .annotations()
                .as_ref()
                .unwrap()
                .get(REF_NAME_ANNOTATION)
                .unwrap(),
            "tag"
        );

        // Both images remain reachable through the edited index.
        index.image(&first.digest().unwrap()).unwrap();
        index.image(&second.digest().unwrap()).unwrap();
    }

    #[test]
    fn strip_ref_name_without_match_is_noop() {
        let index = Index::empty()
            .append(IndexChild::Image(sample_image()), None)
            .unwrap();
        let digest_before = index.digest().unwrap();
        let stripped = index.strip_ref_name("missing").unwrap();
        assert_eq!(stripped.digest().unwrap(), digest_before);
    }

    #[test]
    fn remove_matching_drops_entries() {
        let image = sample_image();
        let index = Index::empty()
            .append(IndexChild::Image(image.clone()), None)
            .unwrap();
        let digest = image.digest().unwrap();

        let removed = index
            .remove_matching(crate::select::by_digest(digest.clone()))
            .unwrap();
        assert!(removed.descriptors().unwrap().is_empty());
        assert!(matches!(
            removed.image(&digest),
            Err(Error::DescriptorNotFound(_))
        ));
    }

    #[test]
    fn nested_index_lookup() {
        let image = sample_image();
        let inner = Index::empty()
            .append(IndexChild::Image(image.clone()), None)
            .unwrap();
        let outer = Index::empty()
            .append(IndexChild::Index(inner.clone()), None)
            .unwrap();

        let fetched = outer.index(&inner.digest().unwrap()).unwrap();
        let fetched_image = fetched.image(&image.digest().unwrap()).unwrap();
        assert_eq!(fetched_image.digest().unwrap(), image.digest().unwrap());
    }
}
