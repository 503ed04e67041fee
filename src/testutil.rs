//! Shared test fixtures: handcrafted tar streams and in-memory images.

use oci_spec::image::MediaType;
use serde_json::json;
use tar::{Builder, EntryType, Header};

use crate::image::Image;
use crate::layer::Layer;

fn header(entry_type: EntryType, size: u64) -> Header {
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

pub(crate) fn add_dir(builder: &mut Builder<Vec<u8>>, name: &str) {
    let mut header = header(EntryType::Directory, 0);
    builder
        .append_data(&mut header, name, std::io::empty())
        .unwrap();
}

pub(crate) fn add_file(builder: &mut Builder<Vec<u8>>, name: &str, content: &[u8]) {
    let mut header = header(EntryType::Regular, content.len() as u64);
    builder.append_data(&mut header, name, content).unwrap();
}

pub(crate) fn add_hardlink(builder: &mut Builder<Vec<u8>>, name: &str, target: &str) {
    let mut header = header(EntryType::Link, 0);
    builder.append_link(&mut header, name, target).unwrap();
}

pub(crate) fn add_symlink(builder: &mut Builder<Vec<u8>>, name: &str, target: &str) {
    let mut header = header(EntryType::Symlink, 0);
    builder.append_link(&mut header, name, target).unwrap();
}

/// Build a tar stream out of (name, content) pairs. Names with a trailing
/// slash become directories.
pub(crate) fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (name, content) in entries {
        if name.ends_with('/') {
            add_dir(&mut builder, name);
        } else {
            add_file(&mut builder, name, content);
        }
    }
    builder.into_inner().unwrap()
}

#[derive(Debug, PartialEq)]
pub(crate) struct TarEntryInfo {
    pub name: String,
    pub entry_type: EntryType,
    pub content: Vec<u8>,
    pub linkname: Option<String>,
}

/// Summarize the entries of a tar stream for assertions.
pub(crate) fn tar_entries(bytes: &[u8]) -> Vec<TarEntryInfo> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();
        let linkname = entry
            .link_name()
            .unwrap()
            .map(|l| l.to_string_lossy().into_owned());
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
        out.push(TarEntryInfo {
            name,
            entry_type,
            content,
            linkname,
        });
    }
    out
}

/// Build an in-memory image from uncompressed layer tars. Layers are
/// stored gzip-compressed with OCI media types and the config carries
/// matching diff-ids.
pub(crate) fn image_with_layers(layer_tars: &[Vec<u8>]) -> Image {
    let layers: Vec<Layer> = layer_tars
        .iter()
        .map(|t| Layer::from_uncompressed_tar(t.clone(), MediaType::ImageLayerGzip))
        .collect();

    let diff_ids: Vec<String> = layers
        .iter()
        .map(|l| l.diff_id().unwrap().to_string())
        .collect();

    let config = json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {},
        "rootfs": {
            "type": "layers",
            "diff_ids": diff_ids,
        },
        "history": [
            {"created_by": "layer", "comment": "fixture"},
        ],
    });

    Image::from_parts(
        serde_json::to_vec(&config).unwrap(),
        MediaType::ImageConfig,
        layers,
        MediaType::ImageManifest,
    )
    .unwrap()
}
