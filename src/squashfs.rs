//! SquashFS bridge.
//!
//! Adapts between tar-format OCI layers and SquashFS-format layers by
//! driving external converter programs (`tar2sqfs`, `sqfstar`,
//! `sqfs2tar`) over stdin/stdout. SquashFS is not a streaming format, so
//! each conversion materialises an intermediate file inside a scratch
//! directory owned by the converted layer; dropping the layer removes it.

use std::env;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;

use bytes::Bytes;
use oci_spec::image::{Digest, MediaType};
use once_cell::sync::OnceCell;
use tempfile::TempDir;
use tracing::debug;

use crate::layer::{Layer, LayerReader, StaticLayer};
use crate::util::{CancelReader, CancelToken};
use crate::whiteout::{aufs_to_overlayfs, overlayfs_to_aufs, scan_aufs_whiteouts};
use crate::{digest, media, Error, Result};

/// Options for converting a tar layer to SquashFS format.
#[derive(Clone, Debug, Default)]
pub struct SquashfsOpts {
    /// Converter program to use. A bare name is looked up on `PATH`; by
    /// default `tar2sqfs` is preferred with `sqfstar` as the fallback.
    pub converter: Option<PathBuf>,
    /// Skip the default conversion of AUFS whiteout markers to OverlayFS
    /// markers before handing the stream to the converter.
    pub skip_whiteout_conversion: bool,
    /// Cancellation signal; the converter process is killed on cancel.
    pub cancel: Option<CancelToken>,
}

/// Options for converting a SquashFS layer to tar format.
#[derive(Clone, Debug, Default)]
pub struct TarOpts {
    /// Converter program to use; defaults to `sqfs2tar` from `PATH`.
    pub converter: Option<PathBuf>,
    /// Skip the default conversion of OverlayFS whiteout markers back to
    /// AUFS markers.
    pub skip_whiteout_conversion: bool,
    /// Cancellation signal; the converter process is killed on cancel.
    pub cancel: Option<CancelToken>,
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn look_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolve an explicitly requested converter: paths are used as given,
/// bare names are searched on `PATH`.
fn resolve_program(requested: &Path) -> Result<PathBuf> {
    if requested.components().count() > 1 {
        if is_executable(requested) {
            return Ok(requested.to_path_buf());
        }
    } else if let Some(found) = look_path(&requested.to_string_lossy()) {
        return Ok(found);
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("converter {} not found", requested.display()),
    )))
}

fn program_base(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug)]
struct Converter {
    program: PathBuf,
    args: Vec<String>,
    dir: PathBuf,
    convert_whiteout: bool,
    cancel: Option<CancelToken>,
}

impl Converter {
    fn spawn(&self, extra: &Path, stdin: Stdio, stdout: Stdio, stderr_path: &Path) -> Result<Child> {
        debug!(
            program = %self.program.display(),
            "invoking squashfs converter"
        );
        Ok(Command::new(&self.program)
            .args(&self.args)
            .arg(extra)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::from(File::create(stderr_path)?))
            .spawn()?)
    }

    /// Wait for the child, killing it if the operation is cancelled.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        loop {
            if self.cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Cancelled);
            }
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(std::time::Duration::from_millis(25));
        }
    }

    fn failure(&self, status: ExitStatus, stderr_path: &Path) -> Error {
        let stderr = std::fs::read_to_string(stderr_path).unwrap_or_default();
        Error::ConverterFailure {
            program: program_base(&self.program),
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// Convert the base layer into a layer using the SquashFS format. `dir`
/// is used as the parent of per-conversion scratch directories.
///
/// Layers that are already SquashFS pass through unchanged; layers whose
/// media type is not a recognised tar format fail with
/// [`Error::UnsupportedLayerType`]. Unless disabled, AUFS whiteout
/// markers in the base layer are first translated to OverlayFS form
/// (which reads the base layer twice).
pub fn squashfs_layer(base: &Layer, dir: impl AsRef<Path>, opts: &SquashfsOpts) -> Result<Layer> {
    let program = match &opts.converter {
        Some(requested) => resolve_program(requested)?,
        None => look_path("tar2sqfs")
            .or_else(|| look_path("sqfstar"))
            .ok_or_else(|| Error::SquashfsConverterNotSupported("tar2sqfs, sqfstar".into()))?,
    };

    let args: Vec<String> = match program_base(&program).as_str() {
        // Use gzip compression instead of the default (xz).
        "tar2sqfs" => vec!["--compressor".into(), "gzip".into()],
        // `sqfstar` defaults to the invoking user's uid/gid and the
        // current time for the root inode and superblock; pin them.
        "sqfstar" => vec![
            "-mkfs-time".into(),
            "0".into(),
            "-root-time".into(),
            "0".into(),
            "-root-uid".into(),
            "0".into(),
            "-root-gid".into(),
            "0".into(),
            "-root-mode".into(),
            "0755".into(),
        ],
        other => return Err(Error::SquashfsConverterNotSupported(other.to_string())),
    };

    let media_type = base.media_type();
    if media::is_squashfs_layer(&media_type) {
        return Ok(base.clone());
    }
    if !media::is_tar_layer(&media_type) {
        return Err(Error::UnsupportedLayerType(media_type.to_string()));
    }

    Ok(Layer::Squashfs(SquashfsLayer {
        base: Box::new(base.clone()),
        converter: Arc::new(Converter {
            program,
            args,
            dir: dir.as_ref().to_path_buf(),
            convert_whiteout: !opts.skip_whiteout_conversion,
            cancel: opts.cancel.clone(),
        }),
        artifact: OnceCell::new(),
    }))
}

/// Convert the base layer into a layer using the tar format. `dir` is
/// used as the parent of per-conversion scratch directories.
///
/// Layers that are already tar-format pass through unchanged; layers
/// whose media type is not SquashFS fail with
/// [`Error::UnsupportedLayerType`]. Unless disabled, OverlayFS whiteout
/// markers in the converted stream are translated back to AUFS form.
pub fn tar_layer(base: &Layer, dir: impl AsRef<Path>, opts: &TarOpts) -> Result<Layer> {
    let program = match &opts.converter {
        Some(requested) => resolve_program(requested)?,
        None => look_path("sqfs2tar")
            .ok_or_else(|| Error::SquashfsConverterNotSupported("sqfs2tar".into()))?,
    };

    let media_type = base.media_type();
    if media::is_tar_layer(&media_type) {
        return Ok(base.clone());
    }
    if !media::is_squashfs_layer(&media_type) {
        return Err(Error::UnsupportedLayerType(media_type.to_string()));
    }

    Ok(Layer::Tar(TarLayer {
        base: Box::new(base.clone()),
        converter: Arc::new(Converter {
            program,
            args: Vec::new(),
            dir: dir.as_ref().to_path_buf(),
            convert_whiteout: !opts.skip_whiteout_conversion,
            cancel: opts.cancel.clone(),
        }),
        cache: OnceCell::new(),
    }))
}

/// A SquashFS file produced by a converter, owned by the layer that made
/// it. The scratch directory is removed when the last clone drops.
#[derive(Debug)]
struct SquashfsArtifact {
    _scratch: TempDir,
    path: PathBuf,
    digest: Digest,
    size: u64,
}

/// A tar layer presented in SquashFS format; the file is produced on
/// first access and cached.
#[derive(Clone, Debug)]
pub struct SquashfsLayer {
    base: Box<Layer>,
    converter: Arc<Converter>,
    artifact: OnceCell<Arc<SquashfsArtifact>>,
}

impl SquashfsLayer {
    fn materialise(&self) -> Result<&Arc<SquashfsArtifact>> {
        self.artifact.get_or_try_init(|| {
            let converter = &self.converter;
            let scratch = tempfile::Builder::new()
                .prefix("sqfs-layer-")
                .tempdir_in(&converter.dir)?;
            let sqfs_path = scratch.path().join("layer.sqfs");
            let stderr_path = scratch.path().join("stderr");

            // The translation needs opaque-marker locations up front, so
            // the base layer is scanned first and read again below.
            let scan = if converter.convert_whiteout {
                let scan = scan_aufs_whiteouts(self.base.uncompressed()?)?;
                scan.found_any().then_some(scan)
            } else {
                None
            };

            let mut child =
                converter.spawn(&sqfs_path, Stdio::piped(), Stdio::null(), &stderr_path)?;
            let mut stdin = child.stdin.take().expect("stdin is piped");
            let mut input = CancelReader::new(self.base.uncompressed()?, converter.cancel.clone());
            let feed = match &scan {
                Some(scan) => aufs_to_overlayfs(&mut input, &mut stdin, scan),
                None => io::copy(&mut input, &mut stdin)
                    .map(|_| ())
                    .map_err(Error::from),
            };
            drop(stdin);

            let status = converter.wait(&mut child)?;
            if !status.success() {
                return Err(converter.failure(status, &stderr_path));
            }
            // A converter that exits successfully but left the feed
            // broken (short read, for instance) still fails.
            feed?;

            let (digest, size) = digest::sha256_reader(File::open(&sqfs_path)?)?;
            Ok(Arc::new(SquashfsArtifact {
                _scratch: scratch,
                path: sqfs_path,
                digest,
                size,
            }))
        })
    }

    pub(crate) fn media_type(&self) -> MediaType {
        media::squashfs_layer()
    }

    /// Digest and diff-id coincide: the format is not separately
    /// compressed.
    pub(crate) fn digest(&self) -> Result<Digest> {
        Ok(self.materialise()?.digest.clone())
    }

    pub(crate) fn diff_id(&self) -> Result<Digest> {
        self.digest()
    }

    pub(crate) fn size(&self) -> Result<u64> {
        Ok(self.materialise()?.size)
    }

    pub(crate) fn reader(&self) -> Result<LayerReader> {
        let artifact = self.materialise()?;
        Ok(Box::new(File::open(&artifact.path)?))
    }
}

/// A SquashFS layer presented in tar format; the bytes are produced on
/// first access and cached.
#[derive(Clone, Debug)]
pub struct TarLayer {
    base: Box<Layer>,
    converter: Arc<Converter>,
    cache: OnceCell<Arc<StaticLayer>>,
}

impl TarLayer {
    fn materialise(&self) -> Result<&Arc<StaticLayer>> {
        self.cache.get_or_try_init(|| {
            let converter = &self.converter;
            let scratch = tempfile::Builder::new()
                .prefix("tar-layer-")
                .tempdir_in(&converter.dir)?;
            let sqfs_path = scratch.path().join("layer.sqfs");
            let tar_path = scratch.path().join("layer.tar");
            let stderr_path = scratch.path().join("stderr");

            // The converter needs a seekable input, so the layer bytes
            // are written to a scratch file first.
            let mut input = CancelReader::new(self.base.uncompressed()?, converter.cancel.clone());
            let mut sqfs_file = File::create(&sqfs_path)?;
            if let Err(err) = io::copy(&mut input, &mut sqfs_file) {
                if converter.cancelled() {
                    return Err(Error::Cancelled);
                }
                return Err(err.into());
            }
            drop(sqfs_file);

            let stdout = Stdio::from(File::create(&tar_path)?);
            let mut child = converter.spawn(&sqfs_path, Stdio::null(), stdout, &stderr_path)?;
            let status = converter.wait(&mut child)?;
            if !status.success() {
                return Err(converter.failure(status, &stderr_path));
            }

            let tar_bytes = if converter.convert_whiteout {
                let mut out = Vec::new();
                overlayfs_to_aufs(File::open(&tar_path)?, &mut out)?;
                out
            } else {
                std::fs::read(&tar_path)?
            };

            Ok(Arc::new(StaticLayer::from_uncompressed_tar(
                Bytes::from(tar_bytes),
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
