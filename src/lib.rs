//! Manipulate OCI container images stored in single-file bundles.
//!
//! A bundle treats one file as an OCI image layout: a persistent root
//! index plus a content-addressed blob pool, with in-place mutation
//! (append, replace, remove, garbage-collect). On top of the store sit
//! the layer transformations: squashing an ordered stack of changeset
//! layers into one, translating whiteout conventions between AUFS and
//! OverlayFS, and bridging tar layers to and from SquashFS format via
//! external converter programs.
//!
//! ```no_run
//! use ocibundle::{select, squash, AppendOpts, Bundle, Index, WriteOpts};
//!
//! # fn main() -> ocibundle::Result<()> {
//! let bundle = Bundle::create("app.bundle", &Index::empty(), &WriteOpts {
//!     spare_descriptor_capacity: 8,
//! })?;
//!
//! // ... append an image under a reference name, then squash it:
//! let image = bundle.image(select::by_ref_name("app:v1"))?;
//! let squashed = squash(&image)?;
//! bundle.replace_image(
//!     select::by_ref_name("app:v1"),
//!     &squashed,
//!     &AppendOpts {
//!         reference: Some("app:v1".into()),
//!         ..Default::default()
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod digest;
mod error;
pub mod image;
pub mod index;
pub mod layer;
pub mod media;
pub mod mutate;
pub mod platform;
pub mod select;
pub mod squash;
pub mod squashfs;
mod store;
mod util;
pub mod whiteout;

#[cfg(test)]
pub(crate) mod testutil;

pub use oci_spec;

pub use error::{Error, Result};
pub use image::Image;
pub use index::{Index, IndexChild};
pub use layer::{Layer, LayerReader};
pub use mutate::{apply, LayerSelector, Mutation};
pub use squash::{squash, squash_range, squash_selected};
pub use squashfs::{squashfs_layer, tar_layer, SquashfsOpts, TarOpts};
pub use store::{AppendOpts, Bundle, UpdateOpts, WriteOpts};
pub use util::CancelToken;
