//! Platform matching.
//!
//! Descriptors and image configs carry `{os, architecture, variant}`
//! platform data. Matching normalizes the common architecture aliases
//! (`x86_64`/`amd64`, `aarch64`/`arm64`) and treats the empty arm64
//! variant as `v8`.

use oci_spec::image::{Arch, Descriptor, ImageConfiguration, Os, Platform, PlatformBuilder};

use crate::image::Image;
use crate::{Error, Result};

/// The platform of the running host.
pub fn default_platform() -> Result<Platform> {
    Ok(PlatformBuilder::default()
        .architecture(Arch::default())
        .os(Os::default())
        .build()?)
}

fn normalize(arch: &Arch, variant: Option<&str>) -> (String, String) {
    let arch = match arch.to_string().as_str() {
        "x86_64" | "x86-64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "armhf" => "arm".to_string(),
        other => other.to_string(),
    };
    let variant = variant.unwrap_or("");
    let variant = if arch == "arm64" && (variant.is_empty() || variant == "v8") {
        String::new()
    } else {
        variant.to_string()
    };
    (arch, variant)
}

fn platforms_match(target: &Platform, actual: &Platform) -> bool {
    if target.os() != actual.os() {
        return false;
    }
    if let Some(wanted) = target.os_version() {
        if actual.os_version().as_deref() != Some(wanted.as_str()) {
            return false;
        }
    }
    normalize(target.architecture(), target.variant().as_deref())
        == normalize(actual.architecture(), actual.variant().as_deref())
}

fn display(platform: &Platform) -> String {
    let mut s = format!("{}/{}", platform.os(), platform.architecture());
    if let Some(variant) = platform.variant() {
        if !variant.is_empty() {
            s.push('/');
            s.push_str(variant);
        }
    }
    s
}

fn config_platform(config: &ImageConfiguration) -> Result<Platform> {
    let mut builder = PlatformBuilder::default()
        .architecture(config.architecture().clone())
        .os(config.os().clone());
    if let Some(variant) = config.variant() {
        builder = builder.variant(variant.clone());
    }
    if let Some(os_version) = config.os_version() {
        builder = builder.os_version(os_version.clone());
    }
    Ok(builder.build()?)
}

/// True if `image` satisfies `target`. An image whose config carries no
/// OS is considered to satisfy any platform.
pub fn image_satisfies(image: &Image, target: &Platform) -> Result<bool> {
    let config = image.config_file()?;
    if config.os().to_string().is_empty() {
        return Ok(true);
    }
    Ok(platforms_match(target, &config_platform(&config)?))
}

/// Error unless `image` satisfies `target`.
pub fn ensure_image_satisfies(image: &Image, target: &Platform) -> Result<()> {
    if image_satisfies(image, target)? {
        Ok(())
    } else {
        Err(Error::PlatformNotSatisfied(display(target)))
    }
}

/// True if the descriptor satisfies `target`. A descriptor without
/// platform data satisfies any platform.
pub fn descriptor_satisfies(desc: &Descriptor, target: &Platform) -> bool {
    match desc.platform() {
        Some(actual) => platforms_match(target, actual),
        None => true,
    }
}
