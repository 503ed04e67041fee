//! Descriptor matchers.
//!
//! Root-index operations select entries with a predicate over their
//! descriptors. The constructors here cover the common selections; any
//! `Fn(&Descriptor) -> bool` works.

use oci_spec::image::{Descriptor, Digest, MediaType, Platform};

use crate::platform;

/// Annotation key carrying a human-readable reference name on a
/// root-index entry.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Matches every descriptor.
pub fn match_all(_: &Descriptor) -> bool {
    true
}

/// Matches descriptors with the given digest.
pub fn by_digest(digest: Digest) -> impl Fn(&Descriptor) -> bool {
    move |desc| *desc.digest() == digest
}

/// Matches descriptors with the given media type.
pub fn by_media_type(media_type: MediaType) -> impl Fn(&Descriptor) -> bool {
    move |desc| *desc.media_type() == media_type
}

/// Matches descriptors carrying the given annotation key/value pair.
pub fn by_annotation(
    key: impl Into<String>,
    value: impl Into<String>,
) -> impl Fn(&Descriptor) -> bool {
    let key = key.into();
    let value = value.into();
    move |desc| {
        desc.annotations()
            .as_ref()
            .and_then(|a| a.get(&key))
            .is_some_and(|v| *v == value)
    }
}

/// Matches descriptors whose `org.opencontainers.image.ref.name`
/// annotation equals `name`.
pub fn by_ref_name(name: impl Into<String>) -> impl Fn(&Descriptor) -> bool {
    by_annotation(REF_NAME_ANNOTATION, name)
}

/// Matches image descriptors satisfying `target`, and every non-image
/// descriptor.
pub fn by_platform(target: Platform) -> impl Fn(&Descriptor) -> bool {
    move |desc| {
        if crate::media::is_image_manifest(desc.media_type()) {
            platform::descriptor_satisfies(desc, &target)
        } else {
            true
        }
    }
}
