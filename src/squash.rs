//! Layer-squash engine.
//!
//! Folds an ordered stack of changeset layers into a single tar stream,
//! applying whiteouts along the way. Layers are processed newest to
//! oldest so that, for each older entry, the engine already knows whether
//! a later layer overrides it before deciding to write.
//!
//! Hard links need deferral: a link cannot be written until its target is
//! committed, and when the target itself has been removed by a later
//! layer, a surviving link must take over as the entry carrying the
//! content (the chain is re-rooted onto it).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use oci_spec::image::{Digest, MediaType};
use once_cell::sync::OnceCell;
use tar::{Archive, Builder, Entry, EntryType, Header};
use tracing::debug;

use crate::image::Image;
use crate::layer::{LayerReader, StaticLayer};
use crate::mutate::{apply, LayerSelector, Mutation};
use crate::util::{clean_path, join_path, parent_dir, split_path, xattr_records};
use crate::whiteout::{AUFS_OPAQUE_MARKER, AUFS_WHITEOUT_PREFIX};
use crate::{Error, Result};

/// Replace all layers in the base image with a single, squashed layer.
pub fn squash(base: &Image) -> Result<Image> {
    squash_selected(base, LayerSelector::all())
}

/// Replace the layers in `[start, end)` with a single squashed layer.
pub fn squash_range(base: &Image, start: i64, end: i64) -> Result<Image> {
    squash_selected(base, LayerSelector::range(start, end))
}

/// Replace the selected layers with a single squashed layer, placed at
/// the position of the first selected layer.
pub fn squash_selected(base: &Image, selector: LayerSelector) -> Result<Image> {
    let layer = crate::layer::Layer::Squashed(SquashedLayer::new(base.clone(), selector.clone()));
    apply(base, [Mutation::ReplaceSelectedLayers(selector, layer)])
}

/// Write the squash of the selected layers of `image` into `out` as an
/// uncompressed tar stream.
pub(crate) fn squash_to(image: &Image, selector: &LayerSelector, out: impl Write) -> Result<()> {
    let layers = selector.layers_selected(image)?;
    debug!(layers = layers.len(), "squashing layer stack");

    let mut state = SquashState::new(out);
    for layer in layers.iter().rev() {
        let mut archive = Archive::new(layer.uncompressed()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            state.write_changeset_entry(&mut entry)?;
        }
        state.commit_changeset()?;
    }
    state.finish()
}

/// The result of squashing selected layers of an image; the tar stream is
/// produced on first access and cached.
#[derive(Clone, Debug)]
pub struct SquashedLayer {
    image: Box<Image>,
    selector: LayerSelector,
    cache: OnceCell<Arc<StaticLayer>>,
}

impl SquashedLayer {
    pub(crate) fn new(image: Image, selector: LayerSelector) -> Self {
        Self {
            image: Box::new(image),
            selector,
            cache: OnceCell::new(),
        }
    }

    fn materialise(&self) -> Result<&Arc<StaticLayer>> {
        self.cache.get_or_try_init(|| {
            let mut buf = Vec::new();
            squash_to(&self.image, &self.selector, &mut buf)?;
            Ok(Arc::new(StaticLayer::from_uncompressed_tar(
                Bytes::from(buf),
                MediaType::ImageLayerGzip,
            )))
        })
    }

    pub(crate) fn media_type(&self) -> MediaType {
        MediaType::ImageLayerGzip
    }

    pub(crate) fn digest(&self) -> Result<Digest> {
        Ok(self.materialise()?.digest())
    }

    pub(crate) fn diff_id(&self) -> Result<Digest> {
        Ok(self.materialise()?.diff_id())
    }

    pub(crate) fn size(&self) -> Result<u64> {
        Ok(self.materialise()?.size())
    }

    pub(crate) fn compressed(&self) -> Result<LayerReader> {
        Ok(self.materialise()?.compressed_reader())
    }

    pub(crate) fn uncompressed(&self) -> Result<LayerReader> {
        Ok(self.materialise()?.uncompressed_reader())
    }
}

/// The shadowing effect of entries and whiteouts from later layers.
#[derive(Clone, Copy, Debug, Default)]
struct Shadow {
    /// A later layer wrote or explicitly removed this exact path.
    exact: bool,
    /// Entries beneath this path are shadowed by a later layer.
    children: bool,
}

/// A non-directory entry held for hard-link resolution, or a pending hard
/// link itself.
#[derive(Clone, Debug)]
struct PendingEntry {
    header: Header,
    name: String,
    linkname: Option<String>,
    pax: Vec<(String, Vec<u8>)>,
    shadowed: bool,
    /// Buffered content, kept only while the layer commits; populated for
    /// shadowed entries because a hard link in an older position of the
    /// layer may still need the bytes.
    data: Vec<u8>,
}

struct SquashState<W: Write> {
    out: Builder<W>,
    image_shadows: HashMap<String, Shadow>,
    image_links: HashMap<String, Vec<PendingEntry>>,
    layer_whiteouts: HashMap<String, Shadow>,
    layer_entries: Vec<PendingEntry>,
}

impl<W: Write> SquashState<W> {
    fn new(out: W) -> Self {
        Self {
            out: Builder::new(out),
            image_shadows: HashMap::new(),
            image_links: HashMap::new(),
            layer_whiteouts: HashMap::new(),
            layer_entries: Vec::new(),
        }
    }

    /// True if `name` is modified or removed by a later changeset.
    fn is_shadowed(&self, name: &str) -> bool {
        if let Some(shadow) = self.image_shadows.get(name) {
            if shadow.exact {
                return true;
            }
        }

        let mut current = name.to_string();
        while current != "." {
            let dir = parent_dir(&current);
            if let Some(shadow) = self.image_shadows.get(&dir) {
                if shadow.children {
                    return true;
                }
            }
            current = dir;
        }

        false
    }

    /// Process one entry of the layer currently being read.
    fn write_changeset_entry<R: Read>(&mut self, entry: &mut Entry<'_, R>) -> Result<()> {
        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let (dir, base) = split_path(&raw_name);

        // Whiteouts are not written; they only cast shadows.
        if base.starts_with(AUFS_WHITEOUT_PREFIX) {
            let opaque = base == AUFS_OPAQUE_MARKER;
            let name = if opaque {
                clean_path(dir)
            } else {
                clean_path(&join_path(
                    dir,
                    base.strip_prefix(AUFS_WHITEOUT_PREFIX).unwrap_or(base),
                ))
            };
            let shadow = self.layer_whiteouts.entry(name).or_default();
            shadow.children = true;
            if !opaque {
                shadow.exact = true;
            }
            return Ok(());
        }

        let name = clean_path(&raw_name);
        let shadowed = self.is_shadowed(&name);
        let header = entry.header().clone();
        let entry_type = header.entry_type();
        let pax = xattr_records(entry)?;
        let linkname = match entry_type {
            EntryType::Link | EntryType::Symlink => {
                let target = entry.link_name()?.ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("link entry {name:?} has no target"),
                    ))
                })?;
                Some(target.to_string_lossy().into_owned())
            }
            _ => None,
        };

        // Hard links are set aside; they cannot be written until their
        // target is committed.
        if entry_type == EntryType::Link {
            self.image_shadows.insert(
                name.clone(),
                Shadow {
                    exact: true,
                    children: true,
                },
            );
            let target = linkname.clone().unwrap_or_default();
            self.image_links.entry(target).or_default().push(PendingEntry {
                header,
                name,
                linkname,
                pax,
                shadowed,
                data: Vec::new(),
            });
            return Ok(());
        }

        if !shadowed {
            self.emit_from_reader(&header, &name, linkname.as_deref(), &pax, entry)?;
            self.image_shadows.insert(
                name.clone(),
                Shadow {
                    exact: true,
                    children: entry_type != EntryType::Directory,
                },
            );
        }

        // One or more hard links may reference a non-directory entry, so
        // keep it around until the layer commits.
        if entry_type != EntryType::Directory {
            let mut data = Vec::new();
            if shadowed && header.size()? > 0 {
                entry.read_to_end(&mut data)?;
            }
            self.layer_entries.push(PendingEntry {
                header,
                name,
                linkname,
                pax,
                shadowed,
                data,
            });
        }

        Ok(())
    }

    /// Merge this layer's whiteouts into the image shadows and resolve
    /// pending hard links that target this layer's entries.
    fn commit_changeset(&mut self) -> Result<()> {
        for (name, whiteout) in std::mem::take(&mut self.layer_whiteouts) {
            let existing = self.image_shadows.get(&name).copied().unwrap_or_default();
            self.image_shadows.insert(
                name,
                Shadow {
                    exact: whiteout.exact || existing.exact,
                    children: whiteout.children || existing.children,
                },
            );
        }

        for entry in std::mem::take(&mut self.layer_entries) {
            let target = entry.name.clone();
            self.write_hardlinks_for(&target, entry)?;
        }

        Ok(())
    }

    /// Evaluate all hard links pointing at `target`, directly or
    /// transitively through other links. `root` is the entry carrying the
    /// content; when it is not part of the output, the first surviving
    /// link is promoted to a full entry and becomes the new root.
    fn write_hardlinks_for(&mut self, target: &str, mut root: PendingEntry) -> Result<PendingEntry> {
        let links = self.image_links.remove(target).unwrap_or_default();
        for mut link in links {
            let link_target = link.name.clone();

            if !link.shadowed {
                if root.shadowed {
                    // The content root is not in the output; transform
                    // this link into the root.
                    link.header.set_entry_type(root.header.entry_type());
                    link.header.set_size(root.header.size()?);
                    if matches!(
                        root.header.entry_type(),
                        EntryType::Char | EntryType::Block
                    ) {
                        if let Some(major) = root.header.device_major()? {
                            link.header.set_device_major(major)?;
                        }
                        if let Some(minor) = root.header.device_minor()? {
                            link.header.set_device_minor(minor)?;
                        }
                    }
                    link.linkname = root.linkname.clone();
                    link.pax = root.pax.clone();
                    link.data = std::mem::take(&mut root.data);
                    link.shadowed = false;
                    self.emit_pending(&link)?;
                    root = link;
                } else {
                    // The root is in the output; write the link pointed
                    // at it. Pointing at the root rather than the link's
                    // original target keeps the chain intact when an
                    // intermediate link was dropped.
                    let mut header = link.header.clone();
                    self.write_pax(&link.pax)?;
                    self.out.append_link(&mut header, &link.name, &root.name)?;
                }
            }

            root = self.write_hardlinks_for(&link_target, root)?;
        }

        Ok(root)
    }

    fn write_pax(&mut self, pax: &[(String, Vec<u8>)]) -> io::Result<()> {
        if pax.is_empty() {
            return Ok(());
        }
        self.out
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
    }

    /// Write header and streamed content to the output. Directory names
    /// get a trailing separator; everything else is written cleaned.
    fn emit_from_reader<R: Read>(
        &mut self,
        header: &Header,
        name: &str,
        linkname: Option<&str>,
        pax: &[(String, Vec<u8>)],
        content: &mut Entry<'_, R>,
    ) -> Result<()> {
        self.write_pax(pax)?;
        let mut header = header.clone();
        match header.entry_type() {
            EntryType::Link | EntryType::Symlink => {
                let target = linkname.ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("link entry {name:?} has no target"),
                    ))
                })?;
                self.out.append_link(&mut header, name, target)?;
            }
            EntryType::Directory => {
                self.out
                    .append_data(&mut header, format!("{name}/"), io::empty())?;
            }
            _ => {
                self.out.append_data(&mut header, name, content)?;
            }
        }
        Ok(())
    }

    /// Write a pending entry from its buffered bytes.
    fn emit_pending(&mut self, entry: &PendingEntry) -> Result<()> {
        self.write_pax(&entry.pax)?;
        let mut header = entry.header.clone();
        match header.entry_type() {
            EntryType::Link | EntryType::Symlink => {
                let target = entry.linkname.as_deref().ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("link entry {:?} has no target", entry.name),
                    ))
                })?;
                self.out.append_link(&mut header, &entry.name, target)?;
            }
            _ => {
                header.set_size(entry.data.len() as u64);
                self.out
                    .append_data(&mut header, &entry.name, entry.data.as_slice())?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.out.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        add_dir, add_file, add_hardlink, add_symlink, image_with_layers, layer_tar, tar_entries,
    };
    use tar::Builder as TarBuilder;

    fn squashed_tar(image: &Image) -> Vec<u8> {
        let squashed = squash(image).unwrap();
        let layers = squashed.layers().unwrap();
        assert_eq!(layers.len(), 1);
        let mut out = Vec::new();
        layers[0]
            .uncompressed()
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn names(tar_bytes: &[u8]) -> Vec<String> {
        tar_entries(tar_bytes)
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn file_whiteout_removes_lower_entry() {
        let base = image_with_layers(&[
            layer_tar(&[("a/", b""), ("a/b/", b""), ("a/b/foo", b"foo")]),
            layer_tar(&[
                ("a/", b""),
                ("a/b/", b""),
                ("a/b/.wh.foo", b""),
                ("a/b/bar", b"bar"),
            ]),
        ]);

        let out = squashed_tar(&base);
        let entries = tar_entries(&out);

        assert_eq!(
            names(&out),
            vec!["a/".to_string(), "a/b/".to_string(), "a/b/bar".to_string()]
        );
        assert_eq!(entries[2].content, b"bar");
    }

    #[test]
    fn opaque_whiteout_hides_lower_directory_contents() {
        let base = image_with_layers(&[
            layer_tar(&[("a/", b""), ("a/old1", b"1"), ("a/old2", b"2"), ("keep", b"k")]),
            layer_tar(&[("a/", b""), ("a/.wh..wh..opq", b""), ("a/new", b"n")]),
        ]);

        let out = squashed_tar(&base);
        assert_eq!(
            names(&out),
            vec!["a/".to_string(), "a/new".to_string(), "keep".to_string()]
        );
    }

    #[test]
    fn squash_output_contains_no_whiteouts() {
        let base = image_with_layers(&[
            layer_tar(&[("a/", b""), ("a/x", b"x"), ("a/y", b"y")]),
            layer_tar(&[("a/", b""), ("a/.wh.x", b""), ("b/", b""), ("b/.wh..wh..opq", b"")]),
        ]);

        let out = squashed_tar(&base);
        for entry in tar_entries(&out) {
            let (_, base) = crate::util::split_path(&entry.name);
            assert!(
                !base.starts_with(AUFS_WHITEOUT_PREFIX),
                "whiteout {} leaked into squash output",
                entry.name
            );
        }
    }

    #[test]
    fn newer_layer_content_wins() {
        let base = image_with_layers(&[
            layer_tar(&[("f", b"old")]),
            layer_tar(&[("f", b"new")]),
        ]);

        let out = squashed_tar(&base);
        let entries = tar_entries(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, b"new");
    }

    #[test]
    fn squash_single_layer_is_idempotent() {
        // Hard links resolve when the layer commits, so they sit last in
        // the fixture to keep the entry order comparable.
        let mut builder = TarBuilder::new(Vec::new());
        add_dir(&mut builder, "a/");
        add_file(&mut builder, "a/foo", b"foo");
        add_symlink(&mut builder, "a/baz", "foo");
        add_hardlink(&mut builder, "a/bar", "a/foo");
        let layer = builder.into_inner().unwrap();

        let base = image_with_layers(&[layer.clone()]);
        let out = squashed_tar(&base);

        let expected = tar_entries(&layer);
        let actual = tar_entries(&out);
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert_eq!(e.name, a.name);
            assert_eq!(e.entry_type, a.entry_type);
            assert_eq!(e.content, a.content);
            assert_eq!(e.linkname, a.linkname);
        }
    }

    #[test]
    fn hard_link_chain_reroots_on_surviving_link() {
        // Layer 0: foo plus bar -> foo. Layer 1: baz -> bar.
        // Layer 2 removes bar. The squash must keep foo, drop bar, and
        // emit baz as a hard link to foo.
        let mut l0 = TarBuilder::new(Vec::new());
        add_dir(&mut l0, "a/");
        add_dir(&mut l0, "a/b/");
        add_file(&mut l0, "a/b/foo", b"foo");
        add_hardlink(&mut l0, "a/b/bar", "a/b/foo");

        let mut l1 = TarBuilder::new(Vec::new());
        add_hardlink(&mut l1, "a/b/baz", "a/b/bar");

        let l2 = layer_tar(&[("a/b/.wh.bar", b"")]);

        let base = image_with_layers(&[
            l0.into_inner().unwrap(),
            l1.into_inner().unwrap(),
            l2,
        ]);

        let out = squashed_tar(&base);
        let entries = tar_entries(&out);

        assert_eq!(
            names(&out),
            vec![
                "a/".to_string(),
                "a/b/".to_string(),
                "a/b/foo".to_string(),
                "a/b/baz".to_string()
            ]
        );
        let baz = &entries[3];
        assert_eq!(baz.entry_type, EntryType::Link);
        assert_eq!(baz.linkname.as_deref(), Some("a/b/foo"));
    }

    #[test]
    fn hard_link_promoted_when_target_removed() {
        // Layer 0: foo plus bar -> foo. Layer 1 removes foo. The link
        // must be promoted to a full entry carrying foo's content.
        let mut l0 = TarBuilder::new(Vec::new());
        add_file(&mut l0, "foo", b"content");
        add_hardlink(&mut l0, "bar", "foo");

        let l1 = layer_tar(&[(".wh.foo", b"")]);

        let base = image_with_layers(&[l0.into_inner().unwrap(), l1]);

        let out = squashed_tar(&base);
        let entries = tar_entries(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "bar");
        assert_eq!(entries[0].entry_type, EntryType::Regular);
        assert_eq!(entries[0].content, b"content");
    }

    #[test]
    fn squash_replaces_layers_in_image() {
        let base = image_with_layers(&[
            layer_tar(&[("a", b"1")]),
            layer_tar(&[("b", b"2")]),
        ]);
        let squashed = squash(&base).unwrap();

        let layers = squashed.layers().unwrap();
        assert_eq!(layers.len(), 1);

        // diff-id consistency after the squash mutation
        let config = squashed.config_file().unwrap();
        assert_eq!(
            *config.rootfs().diff_ids(),
            vec![layers[0].diff_id().unwrap().to_string()]
        );
    }

    #[test]
    fn squash_is_deterministic() {
        let base = image_with_layers(&[
            layer_tar(&[("a/", b""), ("a/x", b"x")]),
            layer_tar(&[("a/y", b"y")]),
        ]);
        let first = squash(&base).unwrap().layers().unwrap()[0].digest().unwrap();
        let second = squash(&base).unwrap().layers().unwrap()[0].digest().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_range_leaves_image_unchanged() {
        let base = image_with_layers(&[
            layer_tar(&[("a", b"1")]),
            layer_tar(&[("b", b"2")]),
        ]);
        let out = squash_range(&base, 1, 1).unwrap();
        assert_eq!(out.layers().unwrap().len(), 2);
    }

    #[test]
    fn out_of_range_selection_is_an_error() {
        let base = image_with_layers(&[layer_tar(&[("a", b"1")])]);
        assert!(matches!(
            squash_range(&base, 0, 5),
            Err(Error::InvalidLayerIndex)
        ));
    }

    #[test]
    fn negative_index_selects_from_end() {
        let base = image_with_layers(&[
            layer_tar(&[("a", b"1")]),
            layer_tar(&[("b", b"2")]),
            layer_tar(&[("c", b"3")]),
        ]);
        let out = squash_selected(&base, LayerSelector::indices(vec![-2, -1])).unwrap();
        let layers = out.layers().unwrap();
        assert_eq!(layers.len(), 2);

        // First layer kept, the last two folded into one.
        let base_layers = base.layers().unwrap();
        assert_eq!(
            layers[0].digest().unwrap(),
            base_layers[0].digest().unwrap()
        );

        let mut tar = Vec::new();
        layers[1].uncompressed().unwrap().read_to_end(&mut tar).unwrap();
        assert_eq!(names(&tar), vec!["c".to_string(), "b".to_string()]);
    }
}
