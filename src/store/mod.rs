//! Artifact store.
//!
//! A [`Bundle`] treats a single file as an OCI image layout: a
//! persistent root index plus a content-addressed blob pool. Mutating
//! operations reconcile the pool to exactly the blobs reachable from the
//! new root; unreachable blobs are removed as a side effect.
//!
//! The bundle handle is cheap to clone; clones share the underlying
//! file. Mutations through one handle are serialised by an internal
//! lock, read operations proceed in parallel with each other but not
//! with a mutation. In-flight blob readers should be drained before a
//! mutation runs: compaction moves blob data under them.

mod file;
mod update;
mod write;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use bytes::Bytes;
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, MediaType, Platform};
use tracing::debug;

use crate::image::Image;
use crate::index::{BackedIndex, Index, IndexChild};
use crate::layer::LayerReader;
use crate::platform;
use crate::select::REF_NAME_ANNOTATION;
use crate::util::{check_cancel, CancelToken};
use crate::{digest, media, Error, Result};

use file::{BlobFile, CreateOpts, DeleteOpts, KIND_OCI_BLOB, KIND_ROOT_INDEX};

/// Options for creating a bundle file.
#[derive(Clone, Debug, Default)]
pub struct WriteOpts {
    /// Extra descriptor slots beyond what the root index requires,
    /// allowing later appends without rewriting the table.
    pub spare_descriptor_capacity: u64,
}

/// Options for root-index updates.
#[derive(Clone, Debug, Default)]
pub struct UpdateOpts {
    /// Parent directory for the per-operation scratch directory. The
    /// system temp dir is used when unset.
    pub temp_dir: Option<PathBuf>,
    /// Cancellation signal.
    pub cancel: Option<CancelToken>,
}

/// Options for append and replace operations.
#[derive(Clone, Debug, Default)]
pub struct AppendOpts {
    /// Reference name to stamp on the new entry as
    /// `org.opencontainers.image.ref.name`. Any existing entry carrying
    /// the same value loses the annotation first.
    pub reference: Option<String>,
    /// Parent directory for the per-operation scratch directory.
    pub temp_dir: Option<PathBuf>,
    /// Cancellation signal.
    pub cancel: Option<CancelToken>,
}

impl AppendOpts {
    fn update_opts(&self) -> UpdateOpts {
        UpdateOpts {
            temp_dir: self.temp_dir.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Handle to a single-file OCI bundle.
#[derive(Clone, Debug)]
pub struct Bundle {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// Serialises mutating operations end to end.
    mutate: Mutex<()>,
    store: RwLock<BlobFile>,
}

impl Bundle {
    /// Create a bundle file at `path` holding `index` as its root. The
    /// file gets exactly the required descriptor capacity plus any
    /// requested spare.
    pub fn write(path: impl AsRef<Path>, index: &Index, opts: &WriteOpts) -> Result<()> {
        let required = write::descriptor_count_for_index(index)?;
        let mut store = BlobFile::create_at(
            path,
            CreateOpts {
                descriptor_capacity: required + opts.spare_descriptor_capacity,
                deterministic: true,
            },
        )?;
        write::write_index(&mut store, index, true)
    }

    /// [`Bundle::write`] followed by [`Bundle::load`].
    pub fn create(path: impl AsRef<Path>, index: &Index, opts: &WriteOpts) -> Result<Bundle> {
        Self::write(&path, index, opts)?;
        Self::load(path)
    }

    /// Open an existing bundle file.
    pub fn load(path: impl AsRef<Path>) -> Result<Bundle> {
        let store = BlobFile::load(path)?;
        Ok(Bundle {
            shared: Arc::new(Shared {
                mutate: Mutex::new(()),
                store: RwLock::new(store),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BlobFile> {
        self.shared.store.read().expect("store lock poisoned")
    }

    fn blob_descriptor(&self, digest: &Digest) -> Result<file::BlobDescriptor> {
        let raw = digest::raw_sha256(digest)?;
        let store = self.read();
        store
            .descriptor(KIND_OCI_BLOB, &raw)
            .or_else(|| store.descriptor(KIND_ROOT_INDEX, &raw))
            .ok_or_else(|| Error::BlobNotFound(digest.to_string()))
    }

    /// A stream over the blob with the given digest.
    pub fn blob(&self, digest: &Digest) -> Result<LayerReader> {
        let desc = self.blob_descriptor(digest)?;
        Ok(Box::new(self.read().reader(&desc)))
    }

    /// The bytes of the blob with the given digest.
    pub fn bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let desc = self.blob_descriptor(digest)?;
        self.read().data(&desc)
    }

    /// Offset of the blob's data within the bundle file.
    pub fn offset(&self, digest: &Digest) -> Result<u64> {
        let desc = self.blob_descriptor(digest)?;
        Ok(self.read().offset(&desc))
    }

    /// The persistent root index.
    pub fn root_index(&self) -> Result<Index> {
        let raw: Bytes = {
            let store = self.read();
            let descriptors = store.descriptors(KIND_ROOT_INDEX);
            let desc = descriptors
                .first()
                .ok_or_else(|| Error::InvalidBundle("no root index".into()))?;
            store.data(desc)?.into()
        };

        let desc = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(digest::sha256(&raw))
            .size(raw.len() as u64)
            .build()?;
        Ok(Index::Backed(BackedIndex::new(self.clone(), desc, raw)))
    }

    /// Descriptors of root-index entries selected by `matcher`.
    pub fn find_manifests(
        &self,
        matcher: impl Fn(&Descriptor) -> bool,
    ) -> Result<Vec<Descriptor>> {
        Ok(self
            .root_index()?
            .descriptors()?
            .into_iter()
            .filter(|d| matcher(d))
            .collect())
    }

    /// The single image selected by `matcher`. Zero matches (including
    /// matches that are indices, not images) fail with
    /// [`Error::NoMatch`]; several fail with [`Error::MultipleMatches`].
    pub fn image(&self, matcher: impl Fn(&Descriptor) -> bool) -> Result<Image> {
        let root = self.root_index()?;
        let matches: Vec<Descriptor> = root
            .descriptors()?
            .into_iter()
            .filter(|d| media::is_image_manifest(d.media_type()) && matcher(d))
            .collect();
        match matches.as_slice() {
            [] => Err(Error::NoMatch),
            [desc] => root.image(desc.digest()),
            _ => Err(Error::MultipleMatches),
        }
    }

    /// [`Bundle::image`] plus a check that the image's config satisfies
    /// the requested platform.
    pub fn image_for_platform(
        &self,
        matcher: impl Fn(&Descriptor) -> bool,
        target: &Platform,
    ) -> Result<Image> {
        let image = self.image(matcher)?;
        platform::ensure_image_satisfies(&image, target)?;
        Ok(image)
    }

    /// The single sub-index selected by `matcher`.
    pub fn index(&self, matcher: impl Fn(&Descriptor) -> bool) -> Result<Index> {
        let root = self.root_index()?;
        let matches: Vec<Descriptor> = root
            .descriptors()?
            .into_iter()
            .filter(|d| media::is_image_index(d.media_type()) && matcher(d))
            .collect();
        match matches.as_slice() {
            [] => Err(Error::NoMatch),
            [desc] => root.index(desc.digest()),
            _ => Err(Error::MultipleMatches),
        }
    }

    /// Reconcile the bundle so it holds exactly the content of `index`,
    /// which becomes the new root. Blobs not reachable from `index` are
    /// removed; missing blobs are added.
    pub fn update_root_index(&self, index: &Index, opts: &UpdateOpts) -> Result<()> {
        let _guard = self.shared.mutate.lock().expect("mutation lock poisoned");

        let current = self.root_index()?;
        if current.digest()? == index.digest()? {
            return Ok(());
        }

        let existing: HashSet<String> = self
            .read()
            .descriptors(KIND_OCI_BLOB)
            .iter()
            .map(|d| d.digest().to_string())
            .collect();

        // New blobs are staged in a scratch directory first so the
        // delete/append phase below never reads from this bundle.
        let scratch = match &opts.temp_dir {
            Some(dir) => tempfile::tempdir_in(dir)?,
            None => tempfile::tempdir()?,
        };
        let mut plan = update::CachePlan::default();
        update::cache_index_blobs(
            index,
            &existing,
            scratch.path(),
            opts.cancel.as_ref(),
            &mut plan,
        )?;
        let raw_root = index.raw_manifest()?;

        debug!(
            keep = plan.keep.len(),
            add = plan.added.len(),
            "reconciling bundle to new root index"
        );

        let mut store = self.shared.store.write().expect("store lock poisoned");
        store.delete_objects(
            |d| {
                (d.kind == KIND_OCI_BLOB || d.kind == KIND_ROOT_INDEX)
                    && !plan.keep.contains(&d.digest().to_string())
            },
            DeleteOpts {
                zero: true,
                compact: true,
            },
        )?;

        for dg in &plan.added {
            check_cancel(opts.cancel.as_ref())?;
            let blob = File::open(scratch.path().join(dg))?;
            store.add_object(KIND_OCI_BLOB, blob)?;
        }

        store.add_object(KIND_ROOT_INDEX, &raw_root[..])?;
        Ok(())
    }

    fn append_to(&self, root: Index, child: IndexChild, opts: &AppendOpts) -> Result<()> {
        let mut root = root;
        let mut extra = None;
        if let Some(name) = &opts.reference {
            root = root.strip_ref_name(name)?;
            let mut annotations = HashMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), name.clone());
            extra = Some(annotations);
        }

        let new_root = root.append(child, extra)?;
        self.update_root_index(&new_root, &opts.update_opts())
    }

    /// Append an image to the bundle, updating the root index to
    /// reference it.
    pub fn append_image(&self, image: &Image, opts: &AppendOpts) -> Result<()> {
        self.append_to(self.root_index()?, IndexChild::Image(image.clone()), opts)
    }

    /// Append an index to the bundle, updating the root index to
    /// reference it.
    pub fn append_index(&self, index: &Index, opts: &AppendOpts) -> Result<()> {
        self.append_to(self.root_index()?, IndexChild::Index(index.clone()), opts)
    }

    /// Remove all root-index entries selected by `matcher`, then append
    /// `image` in their place.
    pub fn replace_image(
        &self,
        matcher: impl Fn(&Descriptor) -> bool,
        image: &Image,
        opts: &AppendOpts,
    ) -> Result<()> {
        let root = self.root_index()?.remove_matching(matcher)?;
        self.append_to(root, IndexChild::Image(image.clone()), opts)
    }

    /// Remove all root-index entries selected by `matcher`, then append
    /// `index` in their place.
    pub fn replace_index(
        &self,
        matcher: impl Fn(&Descriptor) -> bool,
        index: &Index,
        opts: &AppendOpts,
    ) -> Result<()> {
        let root = self.root_index()?.remove_matching(matcher)?;
        self.append_to(root, IndexChild::Index(index.clone()), opts)
    }

    /// Remove the root-index entries selected by `matcher`; blobs that
    /// become unreachable are garbage-collected.
    pub fn remove_manifests(
        &self,
        matcher: impl Fn(&Descriptor) -> bool,
        opts: &UpdateOpts,
    ) -> Result<()> {
        let root = self.root_index()?.remove_matching(matcher)?;
        self.update_root_index(&root, opts)
    }

    /// Delete one blob from the pool without touching the root index.
    /// For surgical removal only; the root index may be left with a
    /// dangling reference.
    pub fn remove_blob(&self, digest: &Digest) -> Result<()> {
        let _guard = self.shared.mutate.lock().expect("mutation lock poisoned");
        let raw = digest::raw_sha256(digest)?;

        let mut store = self.shared.store.write().expect("store lock poisoned");
        if store.descriptor(KIND_OCI_BLOB, &raw).is_none() {
            return Err(Error::BlobNotFound(digest.to_string()));
        }
        store.delete_objects(
            |d| d.kind == KIND_OCI_BLOB && d.sha256 == raw,
            DeleteOpts {
                zero: true,
                compact: true,
            },
        )?;
        Ok(())
    }
}
