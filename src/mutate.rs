//! Image mutation pipeline.
//!
//! A mutated image is a lazy composition of a base image, ordered layer
//! overrides, an optional history override and an optional config
//! override. Its manifest and config are computed on first observation
//! and cached; the first caller that triggers computation is the only one
//! that runs it.
//!
//! Manifest and config blobs are treated as opaque JSON: only the fields
//! this crate owns (`layers`, `config`, `rootfs.diff_ids`, `history`) are
//! rewritten, everything else round-trips untouched.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use oci_spec::image::{Digest, History, ImageConfiguration, MediaType};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};

use crate::image::Image;
use crate::layer::Layer;
use crate::{digest, media, Error, Result};

/// Selection of layer indices. Negative indices count back from the end;
/// the default selects every layer.
#[derive(Clone, Debug, Default)]
pub struct LayerSelector(Option<Vec<i64>>);

impl LayerSelector {
    /// Select all layers.
    pub fn all() -> Self {
        Self(None)
    }

    /// Select indices from `start` up to (but not including) `end`.
    /// `start >= end` selects nothing.
    pub fn range(start: i64, end: i64) -> Self {
        if start >= end {
            Self(Some(Vec::new()))
        } else {
            Self(Some((start..end).collect()))
        }
    }

    /// Select the given indices.
    pub fn indices(indices: impl Into<Vec<i64>>) -> Self {
        Self(Some(indices.into()))
    }

    /// Whether layer `i` of `n` is selected. An index that normalizes out
    /// of `[0, n)` is an error, reported at expansion time rather than
    /// silently dropped.
    pub(crate) fn index_selected(&self, i: usize, n: usize) -> Result<bool> {
        let Some(indices) = &self.0 else {
            return Ok(true);
        };

        for &index in indices {
            let index = if index < 0 { index + n as i64 } else { index };
            if index < 0 || index >= n as i64 {
                return Err(Error::InvalidLayerIndex);
            }
            if index == i as i64 {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// The selected layers of `image`, in image order.
    pub(crate) fn layers_selected(&self, image: &Image) -> Result<Vec<Layer>> {
        let layers = image.layers()?;
        if self.0.is_none() {
            return Ok(layers);
        }

        let n = layers.len();
        let mut selected = Vec::new();
        for (i, layer) in layers.into_iter().enumerate() {
            if self.index_selected(i, n)? {
                selected.push(layer);
            }
        }
        Ok(selected)
    }
}

/// A single mutation applied by [`apply`].
#[derive(Clone, Debug)]
pub enum Mutation {
    /// Replace the layer at the given index.
    SetLayer(usize, Layer),
    /// Replace all layers with a single layer.
    ReplaceLayers(Layer),
    /// Replace the selected layers with a single layer, in the position
    /// of the first selected layer.
    ReplaceSelectedLayers(LayerSelector, Layer),
    /// Replace the config history with a single entry.
    SetHistory(History),
    /// Replace the config with the given JSON value and media type. For
    /// standard config media types the value must be a config object and
    /// has its `rootfs.diff_ids` rewritten; other media types are emitted
    /// verbatim.
    SetConfig {
        config: Value,
        media_type: MediaType,
    },
}

/// Apply mutations to a base image, returning the resulting image.
/// Applying no mutations returns the base unchanged.
pub fn apply(base: &Image, mutations: impl IntoIterator<Item = Mutation>) -> Result<Image> {
    let mutations: Vec<Mutation> = mutations.into_iter().collect();
    if mutations.is_empty() {
        return Ok(base.clone());
    }

    let mut overrides: Vec<Option<Layer>> = vec![None; base.layers()?.len()];
    let mut history = None;
    let mut config_override = None;

    for mutation in mutations {
        match mutation {
            Mutation::SetLayer(index, layer) => {
                if index >= overrides.len() {
                    return Err(Error::InvalidLayerIndex);
                }
                overrides[index] = Some(layer);
            }
            Mutation::ReplaceLayers(layer) => {
                overrides = vec![Some(layer)];
            }
            Mutation::ReplaceSelectedLayers(selector, layer) => {
                let n = overrides.len();
                let mut replaced = Vec::new();
                let mut found = false;
                for (i, existing) in overrides.iter().enumerate() {
                    if selector.index_selected(i, n)? {
                        if !found {
                            replaced.push(Some(layer.clone()));
                            found = true;
                        }
                    } else {
                        replaced.push(existing.clone());
                    }
                }
                overrides = replaced;
            }
            Mutation::SetHistory(entry) => {
                history = Some(entry);
            }
            Mutation::SetConfig { config, media_type } => {
                config_override = Some((config, media_type));
            }
        }
    }

    Ok(Image::Mutated(MutatedImage {
        base: Box::new(base.clone()),
        overrides,
        history,
        config_override,
        computed: OnceCell::new(),
    }))
}

/// A lazy composition of a base image and mutations.
#[derive(Clone, Debug)]
pub struct MutatedImage {
    base: Box<Image>,
    overrides: Vec<Option<Layer>>,
    history: Option<History>,
    config_override: Option<(Value, MediaType)>,
    computed: OnceCell<Arc<Computed>>,
}

#[derive(Debug)]
struct Computed {
    raw_manifest: Bytes,
    manifest_digest: Digest,
    raw_config: Bytes,
    config_media_type: MediaType,
    layers: Vec<Layer>,
    by_digest: HashMap<String, usize>,
    by_diff_id: HashMap<String, usize>,
}

impl MutatedImage {
    fn populate(&self) -> Result<&Arc<Computed>> {
        self.computed
            .get_or_try_init(|| self.compute().map(Arc::new))
    }

    fn compute(&self) -> Result<Computed> {
        // Parsing the typed manifest up front validates the shape before
        // the JSON tree is edited in place.
        let base_manifest = self.base.manifest()?;
        let base_layers = self.base.layers()?;

        let mut layers = Vec::with_capacity(self.overrides.len());
        for (i, slot) in self.overrides.iter().enumerate() {
            let layer = match slot {
                Some(layer) => layer.clone(),
                None => base_layers
                    .get(i)
                    .ok_or(Error::InvalidLayerIndex)?
                    .clone(),
            };
            layers.push(layer);
        }

        let mut layer_descs = Vec::with_capacity(layers.len());
        let mut diff_ids = Vec::with_capacity(layers.len());
        let mut by_digest = HashMap::new();
        let mut by_diff_id = HashMap::new();
        for (i, layer) in layers.iter().enumerate() {
            layer_descs.push(layer.descriptor()?);
            let diff_id = layer.diff_id()?.to_string();
            by_digest.insert(layer.digest()?.to_string(), i);
            by_diff_id.insert(diff_id.clone(), i);
            diff_ids.push(diff_id);
        }

        let mut manifest_value: Value = serde_json::from_slice(&self.base.raw_manifest()?)?;
        manifest_value["layers"] = serde_json::to_value(&layer_descs)?;

        // Resolve the config value and media type.
        let (config_value, config_media_type) = match &self.config_override {
            Some((value, media_type)) => (Some(value.clone()), media_type.clone()),
            None => {
                let media_type = base_manifest.config().media_type().clone();
                if media::is_config(&media_type) {
                    let value: Value = serde_json::from_slice(&self.base.raw_config_file()?)?;
                    (Some(value), media_type)
                } else {
                    (None, media_type)
                }
            }
        };

        // Standard config formats get their diff-ids (and optionally
        // history) rewritten; anything else is emitted verbatim.
        let config_value = if media::is_config(&config_media_type) {
            let Some(Value::Object(mut obj)) = config_value else {
                return Err(Error::UnexpectedConfigFileType);
            };
            let rootfs = obj.entry("rootfs").or_insert_with(|| json!({}));
            let Some(rootfs) = rootfs.as_object_mut() else {
                return Err(Error::UnexpectedConfigFileType);
            };
            rootfs.insert("diff_ids".to_string(), json!(diff_ids));
            if let Some(history) = &self.history {
                obj.insert("history".to_string(), json!([history]));
            }
            Some(Value::Object(obj))
        } else {
            config_value
        };

        let raw_config: Bytes = match config_value {
            Some(value) => serde_json::to_vec(&value)?.into(),
            None => self.base.raw_config_file()?,
        };

        let config_digest = digest::sha256(&raw_config);
        let config_obj = manifest_value
            .get_mut("config")
            .and_then(|v| v.as_object_mut())
            .ok_or(Error::UnexpectedConfigFileType)?;
        config_obj.insert(
            "mediaType".to_string(),
            json!(config_media_type.to_string()),
        );
        config_obj.insert("digest".to_string(), json!(config_digest.to_string()));
        config_obj.insert("size".to_string(), json!(raw_config.len() as u64));
        if config_obj.get("data").is_some_and(|v| !v.is_null()) {
            config_obj.insert("data".to_string(), json!(BASE64.encode(&raw_config)));
        }

        let raw_manifest: Bytes = serde_json::to_vec(&manifest_value)?.into();
        let manifest_digest = digest::sha256(&raw_manifest);

        Ok(Computed {
            raw_manifest,
            manifest_digest,
            raw_config,
            config_media_type,
            layers,
            by_digest,
            by_diff_id,
        })
    }

    pub(crate) fn media_type(&self) -> MediaType {
        self.base.media_type()
    }

    pub(crate) fn digest(&self) -> Result<Digest> {
        Ok(self.populate()?.manifest_digest.clone())
    }

    pub(crate) fn size(&self) -> Result<u64> {
        Ok(self.populate()?.raw_manifest.len() as u64)
    }

    pub(crate) fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.populate()?.raw_manifest.clone())
    }

    pub(crate) fn raw_config_file(&self) -> Result<Bytes> {
        Ok(self.populate()?.raw_config.clone())
    }

    pub(crate) fn config_file(&self) -> Result<ImageConfiguration> {
        let computed = self.populate()?;
        if !media::is_config(&computed.config_media_type) {
            return Err(Error::UnexpectedConfigFileType);
        }
        Ok(ImageConfiguration::from_reader(&computed.raw_config[..])?)
    }

    pub(crate) fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self.populate()?.layers.clone())
    }

    pub(crate) fn layer_by_digest(&self, digest: &Digest) -> Result<Layer> {
        let computed = self.populate()?;
        computed
            .by_digest
            .get(&digest.to_string())
            .map(|&i| computed.layers[i].clone())
            .ok_or_else(|| Error::LayerNotFound(digest.to_string()))
    }

    pub(crate) fn layer_by_diff_id(&self, diff_id: &Digest) -> Result<Layer> {
        let computed = self.populate()?;
        computed
            .by_diff_id
            .get(&diff_id.to_string())
            .map(|&i| computed.layers[i].clone())
            .ok_or_else(|| Error::LayerNotFound(diff_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use oci_spec::image::HistoryBuilder;

    fn base_image() -> Image {
        testutil::image_with_layers(&[testutil::layer_tar(&[("hello", b"hello world")])])
    }

    fn assert_diff_id_consistency(img: &Image) {
        let config = img.config_file().unwrap();
        let diff_ids: Vec<String> = img
            .layers()
            .unwrap()
            .iter()
            .map(|l| l.diff_id().unwrap().to_string())
            .collect();
        assert_eq!(*config.rootfs().diff_ids(), diff_ids);
    }

    #[test]
    fn no_mutations_is_a_no_op() {
        let base = base_image();
        let img = apply(&base, []).unwrap();
        assert_eq!(img.digest().unwrap(), base.digest().unwrap());
        assert_eq!(img.raw_manifest().unwrap(), base.raw_manifest().unwrap());
    }

    #[test]
    fn set_layer_rewrites_manifest_and_diff_ids() {
        let base = base_image();
        let layer = Layer::from_bytes(
            &b"foobar"[..],
            MediaType::Other(crate::media::DOCKER_LAYER.to_string()),
        );
        let img = apply(&base, [Mutation::SetLayer(0, layer.clone())]).unwrap();

        assert_ne!(img.digest().unwrap(), base.digest().unwrap());
        assert_eq!(img.media_type(), base.media_type());

        let manifest = img.manifest().unwrap();
        assert_eq!(manifest.layers().len(), 1);
        assert_eq!(
            *manifest.layers()[0].digest(),
            layer.digest().unwrap()
        );

        let config = img.config_file().unwrap();
        assert_eq!(
            *config.rootfs().diff_ids(),
            vec![layer.diff_id().unwrap().to_string()]
        );
        assert_diff_id_consistency(&img);

        // The config descriptor tracks the rewritten config bytes.
        let raw_config = img.raw_config_file().unwrap();
        assert_eq!(
            *manifest.config().digest(),
            crate::digest::sha256(&raw_config)
        );
        assert_eq!(manifest.config().size(), raw_config.len() as u64);
    }

    #[test]
    fn set_layer_out_of_range() {
        let base = base_image();
        let layer = Layer::from_bytes(&b"x"[..], MediaType::ImageLayer);
        assert!(matches!(
            apply(&base, [Mutation::SetLayer(1, layer)]),
            Err(Error::InvalidLayerIndex)
        ));
    }

    #[test]
    fn replace_layers_collapses_to_one() {
        let base = testutil::image_with_layers(&[
            testutil::layer_tar(&[("a", b"1")]),
            testutil::layer_tar(&[("b", b"2")]),
        ]);
        let layer = Layer::from_bytes(&b"only"[..], MediaType::ImageLayer);
        let img = apply(&base, [Mutation::ReplaceLayers(layer.clone())]).unwrap();

        let layers = img.layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].digest().unwrap(), layer.digest().unwrap());
        assert_diff_id_consistency(&img);
    }

    #[test]
    fn set_history_replaces_history() {
        let base = base_image();
        let entry = HistoryBuilder::default()
            .author("Author")
            .created("2023-05-02T02:25:50Z")
            .created_by("CreatedBy")
            .comment("Comment")
            .build()
            .unwrap();
        let img = apply(&base, [Mutation::SetHistory(entry)]).unwrap();

        let config: Value = serde_json::from_slice(&img.raw_config_file().unwrap()).unwrap();
        let history = config["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["author"], "Author");
        assert_eq!(history[0]["comment"], "Comment");
        assert_eq!(history[0]["created_by"], "CreatedBy");
        assert_diff_id_consistency(&img);
    }

    #[test]
    fn set_config_custom_media_type_is_verbatim() {
        let base = base_image();
        let custom = json!({"Foo": "Bar"});
        let img = apply(
            &base,
            [Mutation::SetConfig {
                config: custom.clone(),
                media_type: MediaType::Other(
                    "application/vnd.sylabs.container.image.v1+json".to_string(),
                ),
            }],
        )
        .unwrap();

        let raw = img.raw_config_file().unwrap();
        assert_eq!(raw, serde_json::to_vec(&custom).unwrap());

        // A non-standard config cannot be parsed as a config file.
        assert!(matches!(
            img.config_file(),
            Err(Error::UnexpectedConfigFileType)
        ));

        let manifest = img.manifest().unwrap();
        assert_eq!(
            manifest.config().media_type().to_string(),
            "application/vnd.sylabs.container.image.v1+json"
        );
    }

    #[test]
    fn set_config_standard_media_type_rewrites_diff_ids() {
        let base = base_image();
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "author": "Author",
            "config": {},
            "rootfs": {"type": "layers", "diff_ids": []},
        });
        let img = apply(
            &base,
            [Mutation::SetConfig {
                config,
                media_type: MediaType::ImageConfig,
            }],
        )
        .unwrap();

        let parsed = img.config_file().unwrap();
        assert_eq!(parsed.author().as_deref(), Some("Author"));
        assert_diff_id_consistency(&img);
    }

    #[test]
    fn set_config_standard_media_type_requires_object() {
        let base = base_image();
        let result = apply(
            &base,
            [Mutation::SetConfig {
                config: json!("not an object"),
                media_type: MediaType::ImageConfig,
            }],
        )
        .unwrap()
        .raw_config_file();
        assert!(matches!(result, Err(Error::UnexpectedConfigFileType)));
    }

    #[test]
    fn selector_bounds() {
        assert!(LayerSelector::range(2, 2).0.unwrap().is_empty());
        assert!(LayerSelector::range(3, 1).0.unwrap().is_empty());

        let s = LayerSelector::indices(vec![-1]);
        assert!(s.index_selected(1, 2).unwrap());
        assert!(!s.index_selected(0, 2).unwrap());

        let s = LayerSelector::indices(vec![5]);
        assert!(matches!(
            s.index_selected(0, 2),
            Err(Error::InvalidLayerIndex)
        ));
    }
}
