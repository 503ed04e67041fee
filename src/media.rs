//! Media-type families.
//!
//! The core recognises the `application/vnd.oci.*` and
//! `application/vnd.docker.*` families, plus the private SquashFS layer
//! type. Docker types are not first-class [`MediaType`] variants, so the
//! predicates here match them by string.

use oci_spec::image::MediaType;

/// Media type of a SquashFS-format layer.
pub const SQUASHFS_LAYER: &str = "application/vnd.sylabs.image.layer.v1.squashfs";

pub(crate) const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub(crate) const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub(crate) const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub(crate) const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub(crate) const DOCKER_UNCOMPRESSED_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// The SquashFS layer media type as a [`MediaType`] value.
pub fn squashfs_layer() -> MediaType {
    MediaType::Other(SQUASHFS_LAYER.to_string())
}

fn other_is(mt: &MediaType, s: &str) -> bool {
    matches!(mt, MediaType::Other(o) if o == s)
}

/// True for image-manifest media types (OCI or Docker schema 2).
pub fn is_image_manifest(mt: &MediaType) -> bool {
    *mt == MediaType::ImageManifest || other_is(mt, DOCKER_MANIFEST)
}

/// True for index / manifest-list media types.
pub fn is_image_index(mt: &MediaType) -> bool {
    *mt == MediaType::ImageIndex || other_is(mt, DOCKER_MANIFEST_LIST)
}

/// True for standard image-config media types.
pub fn is_config(mt: &MediaType) -> bool {
    *mt == MediaType::ImageConfig || other_is(mt, DOCKER_CONFIG)
}

/// True for gzip-compressed tar layer media types.
pub fn is_gzip_layer(mt: &MediaType) -> bool {
    *mt == MediaType::ImageLayerGzip
        || *mt == MediaType::ImageLayerNonDistributableGzip
        || other_is(mt, DOCKER_LAYER)
}

/// True for uncompressed tar layer media types.
pub fn is_uncompressed_layer(mt: &MediaType) -> bool {
    *mt == MediaType::ImageLayer
        || *mt == MediaType::ImageLayerNonDistributable
        || other_is(mt, DOCKER_UNCOMPRESSED_LAYER)
}

/// True for any tar-format layer media type this crate can stream.
pub fn is_tar_layer(mt: &MediaType) -> bool {
    is_gzip_layer(mt) || is_uncompressed_layer(mt)
}

/// True for the SquashFS layer media type.
pub fn is_squashfs_layer(mt: &MediaType) -> bool {
    other_is(mt, SQUASHFS_LAYER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        assert!(is_image_manifest(&MediaType::ImageManifest));
        assert!(is_image_manifest(&MediaType::Other(DOCKER_MANIFEST.into())));
        assert!(!is_image_manifest(&MediaType::ImageIndex));

        assert!(is_image_index(&MediaType::ImageIndex));
        assert!(is_image_index(&MediaType::Other(
            DOCKER_MANIFEST_LIST.into()
        )));

        assert!(is_config(&MediaType::ImageConfig));
        assert!(is_config(&MediaType::Other(DOCKER_CONFIG.into())));
        assert!(!is_config(&MediaType::Other(
            "application/vnd.sylabs.container.image.v1+json".into()
        )));

        assert!(is_gzip_layer(&MediaType::ImageLayerGzip));
        assert!(is_gzip_layer(&MediaType::Other(DOCKER_LAYER.into())));
        assert!(is_uncompressed_layer(&MediaType::ImageLayer));
        assert!(is_tar_layer(&MediaType::Other(
            DOCKER_UNCOMPRESSED_LAYER.into()
        )));
        assert!(!is_tar_layer(&squashfs_layer()));

        assert!(is_squashfs_layer(&squashfs_layer()));
    }
}
