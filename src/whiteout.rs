//! Whiteout translation between AUFS and OverlayFS conventions.
//!
//! Changeset layers encode removals either as AUFS-style marker files
//! (`.wh.<name>`, `.wh..wh..opq`) or as OverlayFS-style character devices
//! and `trusted.overlay.opaque` extended attributes. Both filters are
//! streaming tar-to-tar transforms.
//!
//! AUFS opaque markers may appear anywhere in a layer, including after the
//! directory they mark, so the AUFS-to-OverlayFS direction needs a scan
//! pass ([`scan_aufs_whiteouts`]) before the filter pass.

use std::collections::HashSet;
use std::io::{self, Read, Write};

use tar::{Archive, Builder, Entry, EntryType, Header};

use crate::util::{clean_path, join_path, split_path, xattr_records};
use crate::{Error, Result};

/// Prefix marking an AUFS whiteout file.
pub(crate) const AUFS_WHITEOUT_PREFIX: &str = ".wh.";

/// Marker file naming an AUFS opaque directory.
pub(crate) const AUFS_OPAQUE_MARKER: &str = ".wh..wh..opq";

/// PAX record key for the OverlayFS opaque xattr.
pub(crate) const OPAQUE_XATTR: &str = "SCHILY.xattr.trusted.overlay.opaque";

/// Result of scanning a layer for AUFS whiteout markers.
#[derive(Clone, Debug, Default)]
pub struct WhiteoutScan {
    /// Directories marked opaque by a `.wh..wh..opq` entry, as cleaned
    /// paths.
    opaque_dirs: HashSet<String>,
    /// Whether any `.wh.<name>` file whiteout is present.
    file_whiteouts: bool,
}

impl WhiteoutScan {
    /// True if the scan found any whiteout markers at all. When false the
    /// filter pass may be skipped and the stream used unchanged.
    pub fn found_any(&self) -> bool {
        self.file_whiteouts || !self.opaque_dirs.is_empty()
    }
}

fn entry_name<R: Read>(entry: &Entry<'_, R>) -> io::Result<String> {
    Ok(String::from_utf8_lossy(&entry.path_bytes()).into_owned())
}

/// Scan pass: read every tar header and record which directories carry an
/// opaque marker and whether any file whiteouts exist.
pub fn scan_aufs_whiteouts(reader: impl Read) -> Result<WhiteoutScan> {
    let mut scan = WhiteoutScan::default();

    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry_name(&entry)?;
        let (parent, base) = split_path(&name);

        if base == AUFS_OPAQUE_MARKER {
            scan.opaque_dirs.insert(clean_path(parent));
        } else if base.starts_with(AUFS_WHITEOUT_PREFIX) {
            scan.file_whiteouts = true;
        }
    }

    Ok(scan)
}

fn write_pax<W: Write>(builder: &mut Builder<W>, pax: &[(String, Vec<u8>)]) -> io::Result<()> {
    if pax.is_empty() {
        return Ok(());
    }
    builder.append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
}

/// Copy one entry through to the output, re-emitting its xattr records.
fn copy_entry<R: Read, W: Write>(
    builder: &mut Builder<W>,
    entry: &mut Entry<'_, R>,
    name: &str,
    pax: &[(String, Vec<u8>)],
) -> Result<()> {
    write_pax(builder, pax)?;

    let mut header = entry.header().clone();
    match header.entry_type() {
        EntryType::Link | EntryType::Symlink => {
            let target = entry.link_name()?.ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("link entry {name:?} has no target"),
                ))
            })?;
            let target = target.into_owned();
            builder.append_link(&mut header, name, target)?;
        }
        _ => {
            builder.append_data(&mut header, name, entry)?;
        }
    }

    Ok(())
}

/// Filter pass: rewrite AUFS whiteouts to OverlayFS whiteouts.
///
/// Opaque marker files are dropped and their parent directory gains the
/// `trusted.overlay.opaque=y` xattr; `.wh.<name>` files become 0:0
/// character devices at `<name>`. The `scan` must come from
/// [`scan_aufs_whiteouts`] over the same stream; an opaque marker whose
/// parent the scan did not record is a caller bug and fails with
/// [`Error::UnexpectedOpaque`].
pub fn aufs_to_overlayfs(reader: impl Read, writer: impl Write, scan: &WhiteoutScan) -> Result<()> {
    let mut archive = Archive::new(reader);
    let mut builder = Builder::new(writer);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry)?;
        let (parent, base) = split_path(&name);

        // Opaque markers are consumed; the scan told us where they live.
        if base == AUFS_OPAQUE_MARKER {
            let parent = clean_path(parent);
            if !scan.opaque_dirs.contains(&parent) {
                return Err(Error::UnexpectedOpaque(parent));
            }
            continue;
        }

        // Rewrite `.wh.<name>` into a character-device whiteout.
        if let Some(stripped) = base.strip_prefix(AUFS_WHITEOUT_PREFIX) {
            let target = join_path(parent, stripped);
            let mut header = entry.header().clone();
            header.set_entry_type(EntryType::Char);
            header.set_size(0);
            header.set_device_major(0)?;
            header.set_device_minor(0)?;
            builder.append_data(&mut header, target, io::empty())?;
            continue;
        }

        let mut pax = xattr_records(&mut entry)?;
        if scan.opaque_dirs.contains(&clean_path(&name)) {
            pax.retain(|(k, _)| k != OPAQUE_XATTR);
            pax.push((OPAQUE_XATTR.to_string(), b"y".to_vec()));
        }

        copy_entry(&mut builder, &mut entry, &name, &pax)?;
    }

    builder.finish()?;
    Ok(())
}

/// Single-pass filter rewriting OverlayFS whiteouts to AUFS whiteouts.
///
/// Directories carrying the opaque xattr lose it and gain a
/// `.wh..wh..opq` marker file directly after them; 0:0 character devices
/// become `.wh.<name>` marker files.
pub fn overlayfs_to_aufs(reader: impl Read, writer: impl Write) -> Result<()> {
    let mut archive = Archive::new(reader);
    let mut builder = Builder::new(writer);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry_name(&entry)?;
        let (parent, base) = split_path(&name);

        let mut pax = xattr_records(&mut entry)?;
        let opaque = pax.iter().any(|(k, v)| k == OPAQUE_XATTR && v == b"y");

        // <dir> with opaque xattr -> <dir> plus <dir>/.wh..wh..opq.
        if entry.header().entry_type() == EntryType::Directory && opaque {
            pax.retain(|(k, _)| k != OPAQUE_XATTR);
            copy_entry(&mut builder, &mut entry, &name, &pax)?;

            let dir_header = entry.header();
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(0);
            header.set_mode(0o600);
            header.set_uid(dir_header.uid()?);
            header.set_gid(dir_header.gid()?);
            header.set_mtime(dir_header.mtime()?);
            if let Ok(Some(user)) = dir_header.username() {
                header.set_username(user)?;
            }
            if let Ok(Some(group)) = dir_header.groupname() {
                header.set_groupname(group)?;
            }
            let marker = join_path(&name, AUFS_OPAQUE_MARKER);
            builder.append_data(&mut header, marker, io::empty())?;
            continue;
        }

        // 0:0 char dev at <name> -> `.wh.<name>` marker file.
        let header = entry.header();
        if header.entry_type() == EntryType::Char
            && header.device_major()? == Some(0)
            && header.device_minor()? == Some(0)
        {
            let target = join_path(parent, &format!("{AUFS_WHITEOUT_PREFIX}{base}"));
            let mut header = header.clone();
            header.set_entry_type(EntryType::Regular);
            header.set_size(0);
            header.set_mode(0o600);
            builder.append_data(&mut header, target, io::empty())?;
            continue;
        }

        copy_entry(&mut builder, &mut entry, &name, &pax)?;
    }

    builder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct EntrySummary {
        name: String,
        entry_type: EntryType,
        size: u64,
        mode: u32,
        uid: u64,
        gid: u64,
        mtime: u64,
        dev: Option<(u32, u32)>,
        xattrs: Vec<(String, Vec<u8>)>,
        content: Vec<u8>,
    }

    fn summarize(tar_bytes: &[u8]) -> Vec<EntrySummary> {
        let mut archive = Archive::new(tar_bytes);
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry_name(&entry).unwrap();
            let xattrs = xattr_records(&mut entry).unwrap();
            let header = entry.header();
            let entry_type = header.entry_type();
            let dev = match entry_type {
                EntryType::Char | EntryType::Block => Some((
                    header.device_major().unwrap().unwrap(),
                    header.device_minor().unwrap().unwrap(),
                )),
                _ => None,
            };
            let summary = EntrySummary {
                name,
                entry_type,
                size: header.size().unwrap(),
                mode: header.mode().unwrap(),
                uid: header.uid().unwrap(),
                gid: header.gid().unwrap(),
                mtime: header.mtime().unwrap(),
                dev,
                xattrs,
                content: Vec::new(),
            };
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push(EntrySummary { content, ..summary });
        }
        out
    }

    fn base_header(entry_type: EntryType, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(if entry_type == EntryType::Directory {
            0o755
        } else {
            0o644
        });
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1234);
        header
    }

    fn append_dir(builder: &mut Builder<Vec<u8>>, name: &str) {
        let mut header = base_header(EntryType::Directory, 0);
        builder.append_data(&mut header, name, io::empty()).unwrap();
    }

    fn append_file(builder: &mut Builder<Vec<u8>>, name: &str, content: &[u8]) {
        let mut header = base_header(EntryType::Regular, content.len() as u64);
        builder.append_data(&mut header, name, content).unwrap();
    }

    fn append_marker(builder: &mut Builder<Vec<u8>>, name: &str) {
        let mut header = base_header(EntryType::Regular, 0);
        header.set_mode(0o600);
        builder.append_data(&mut header, name, io::empty()).unwrap();
    }

    fn aufs_layer() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        append_dir(&mut builder, "dir/");
        append_marker(&mut builder, "dir/.wh..wh..opq");
        append_marker(&mut builder, ".wh.file");
        append_file(&mut builder, "data.txt", b"data");
        builder.into_inner().unwrap()
    }

    #[test]
    fn scan_finds_markers() {
        let scan = scan_aufs_whiteouts(&aufs_layer()[..]).unwrap();
        assert!(scan.found_any());
        assert!(scan.file_whiteouts);
        assert_eq!(scan.opaque_dirs.len(), 1);
        assert!(scan.opaque_dirs.contains("dir"));
    }

    #[test]
    fn scan_of_plain_layer_finds_nothing() {
        let mut builder = Builder::new(Vec::new());
        append_dir(&mut builder, "dir/");
        append_file(&mut builder, "dir/file", b"x");
        let layer = builder.into_inner().unwrap();

        let scan = scan_aufs_whiteouts(&layer[..]).unwrap();
        assert!(!scan.found_any());
    }

    #[test]
    fn aufs_markers_become_overlayfs() {
        let layer = aufs_layer();
        let scan = scan_aufs_whiteouts(&layer[..]).unwrap();
        let mut out = Vec::new();
        aufs_to_overlayfs(&layer[..], &mut out, &scan).unwrap();

        let entries = summarize(&out);
        assert_eq!(entries.len(), 3);

        let dir = &entries[0];
        assert_eq!(dir.name, "dir/");
        assert_eq!(dir.entry_type, EntryType::Directory);
        assert_eq!(
            dir.xattrs,
            vec![(OPAQUE_XATTR.to_string(), b"y".to_vec())]
        );

        let whiteout = &entries[1];
        assert_eq!(whiteout.name, "file");
        assert_eq!(whiteout.entry_type, EntryType::Char);
        assert_eq!(whiteout.dev, Some((0, 0)));
        assert_eq!(whiteout.size, 0);

        assert_eq!(entries[2].name, "data.txt");
        assert_eq!(entries[2].content, b"data");
    }

    #[test]
    fn round_trip_reproduces_aufs_layer() {
        let layer = aufs_layer();
        let scan = scan_aufs_whiteouts(&layer[..]).unwrap();

        let mut overlay = Vec::new();
        aufs_to_overlayfs(&layer[..], &mut overlay, &scan).unwrap();

        let mut aufs = Vec::new();
        overlayfs_to_aufs(&overlay[..], &mut aufs).unwrap();

        similar_asserts::assert_eq!(summarize(&layer), summarize(&aufs));
    }

    #[test]
    fn unscanned_opaque_marker_is_an_error() {
        let layer = aufs_layer();
        let mut out = Vec::new();
        let err = aufs_to_overlayfs(&layer[..], &mut out, &WhiteoutScan::default()).unwrap_err();
        assert!(matches!(err, Error::UnexpectedOpaque(dir) if dir == "dir"));
    }

    #[test]
    fn plain_entries_pass_through_unchanged() {
        let mut builder = Builder::new(Vec::new());
        append_dir(&mut builder, "dir/");
        append_file(&mut builder, "dir/file", b"content");
        let layer = builder.into_inner().unwrap();

        let scan = scan_aufs_whiteouts(&layer[..]).unwrap();
        let mut out = Vec::new();
        aufs_to_overlayfs(&layer[..], &mut out, &scan).unwrap();
        similar_asserts::assert_eq!(summarize(&layer), summarize(&out));

        let mut back = Vec::new();
        overlayfs_to_aufs(&layer[..], &mut back).unwrap();
        similar_asserts::assert_eq!(summarize(&layer), summarize(&back));
    }
}
