use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tokio::{fs::File, io::AsyncReadExt, process::Command};

use super::elf::{self, ImageKind};

/// Extensions a trusted-set entry must carry to be considered at all.
pub const LIBRARY_EXTENSIONS: [&str; 2] = ["so", "a"];

/// Libraries the toolchain is asked for when no trusted set is configured.
pub const DEFAULT_TRUSTED_LIBRARIES: [&str; 5] =
    ["libstdc++.so", "libm.so", "libgcc_s.so", "libgcc.a", "libc.so"];

const SNIFF_LEN: usize = 512;
const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    SharedObject,
    StaticArchive,
    /// GNU ld script, as shipped for `libc.so` on most distributions.
    LinkerScript,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryHandle {
    pub path: PathBuf,
    pub kind: LibraryKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("failed to query {toolchain} for platform libraries: {source}")]
    Query {
        toolchain: String,
        #[source]
        source: io::Error,
    },
    #[error("no usable platform library in the trusted set")]
    Empty,
    #[error("failed to build the trusted set: {0}")]
    Join(#[from] std::env::JoinPathsError),
}

/// Resolves the trusted set, a platform path list, into the libraries every
/// artifact is linked against. Entries with the wrong extension, missing
/// files and files that are not libraries are skipped.
pub async fn resolve_references(trusted_set: &str) -> Result<Vec<LibraryHandle>, ReferenceError> {
    let candidates = std::env::split_paths(trusted_set)
        .filter(|path| !path.as_os_str().is_empty())
        .filter(|path| has_library_extension(path))
        .unique()
        .collect::<Vec<_>>();

    let mut handles = Vec::with_capacity(candidates.len());
    for path in candidates {
        match identify(&path).await {
            Ok(Some(kind)) => handles.push(LibraryHandle { path, kind }),
            Ok(None) => {
                tracing::debug!(path = %path.display(), "Skipping trusted entry, not a library")
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), "Skipping trusted entry: {}", e)
            }
        }
    }

    if handles.is_empty() {
        return Err(ReferenceError::Empty);
    }
    tracing::debug!(count = handles.len(), "Resolved platform libraries");
    Ok(handles)
}

/// Builds the default trusted set by asking the toolchain where each of
/// [`DEFAULT_TRUSTED_LIBRARIES`] lives. Libraries it cannot find are left out.
pub async fn discover_trusted_set(gnucpp_path: &Path) -> Result<String, ReferenceError> {
    let mut found = Vec::with_capacity(DEFAULT_TRUSTED_LIBRARIES.len());

    for library in DEFAULT_TRUSTED_LIBRARIES {
        let out = Command::new(gnucpp_path)
            .arg(format!("-print-file-name={}", library))
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ReferenceError::Query {
                toolchain: gnucpp_path.display().to_string(),
                source,
            })?;

        let printed = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let path = PathBuf::from(&printed);
        // An unknown name is echoed back unchanged instead of failing
        if out.status.success() && path.is_absolute() {
            found.push(path);
        } else {
            tracing::debug!(library, "Toolchain does not know the library");
        }
    }

    let joined = std::env::join_paths(found)?;
    Ok(joined.to_string_lossy().into_owned())
}

fn has_library_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| LIBRARY_EXTENSIONS.contains(&ext))
}

async fn identify(path: &Path) -> io::Result<Option<LibraryKind>> {
    let file = File::open(path).await?;
    if !file.metadata().await?.is_file() {
        return Ok(None);
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(classify(&head))
}

fn classify(head: &[u8]) -> Option<LibraryKind> {
    if head.starts_with(ARCHIVE_MAGIC) {
        return Some(LibraryKind::StaticArchive);
    }
    match elf::image_kind(head) {
        Ok(ImageKind::SharedObject) => return Some(LibraryKind::SharedObject),
        Ok(_) => return None,
        Err(_) => {}
    }

    let text = std::str::from_utf8(head).ok()?;
    (text.contains("GROUP") || text.contains("INPUT")).then_some(LibraryKind::LinkerScript)
}
