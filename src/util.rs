//! Small shared helpers: lexical path handling for tar entry names, PAX
//! xattr record extraction, and the cancellation token accepted by
//! long-running operations.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

pub(crate) const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Lexically clean a tar entry name: collapse `.` and empty components and
/// resolve `..` against preceding components. No trailing separator; the
/// empty path cleans to `.`.
pub(crate) fn clean_path(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in name.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Split a tar entry name into (parent, base). The parent carries no
/// trailing separator; a bare name has parent `""`.
pub(crate) fn split_path(name: &str) -> (&str, &str) {
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

/// Lexical parent directory of a cleaned path, with `.` as the terminal
/// ancestor (matching the shadow-propagation walk in the squash engine).
pub(crate) fn parent_dir(name: &str) -> String {
    match name.rfind('/') {
        Some(i) => name[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Join a parent (possibly empty) and a base name.
pub(crate) fn join_path(parent: &str, base: &str) -> String {
    let parent = parent.strip_suffix('/').unwrap_or(parent);
    if parent.is_empty() {
        base.to_string()
    } else {
        format!("{parent}/{base}")
    }
}

/// Extract the `SCHILY.xattr.*` PAX records of a tar entry as
/// (full key, value) pairs.
pub(crate) fn xattr_records<R: Read>(
    entry: &mut tar::Entry<'_, R>,
) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut records = Vec::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for ext in extensions {
            let ext = ext?;
            if let Ok(key) = ext.key() {
                if key.starts_with(PAX_XATTR_PREFIX) {
                    records.push((key.to_string(), ext.value_bytes().to_vec()));
                }
            }
        }
    }
    Ok(records)
}

/// Cancellation signal for long-running operations.
///
/// Cloned tokens share the flag. On cancellation, the operation kills any
/// external process it is driving, removes its scratch directories, and
/// returns [`Error::Cancelled`] to the caller.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Check an optional token.
pub(crate) fn check_cancel(token: Option<&CancelToken>) -> Result<()> {
    match token {
        Some(t) => t.check(),
        None => Ok(()),
    }
}

/// Reader adapter that fails once its token is cancelled, so a blocking
/// copy into an external process terminates.
pub(crate) struct CancelReader<R> {
    inner: R,
    token: Option<CancelToken>,
}

impl<R: Read> CancelReader<R> {
    pub(crate) fn new(inner: R, token: Option<CancelToken>) -> Self {
        Self { inner, token }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(token) = &self.token {
            if token.is_cancelled() {
                // Not Interrupted: io::copy would retry that forever.
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "operation cancelled",
                ));
            }
        }
        self.inner.read(buf)
    }
}
