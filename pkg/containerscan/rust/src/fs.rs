// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use cap_std::fs::Dir;
use serde::de::DeserializeOwned;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// SubDirFs opens files below a runtime state directory. Absolute paths are
/// stripped so that they are relative to the root, and nothing (including
/// symbolic links and `..` components smuggled in through container ids read
/// from process command lines) can escape the root directory.
pub struct SubDirFs {
    dir: Dir,
    root_path: PathBuf,
}

const MAX_PARSE_FILE_SIZE: u64 = 1024 * 1024; // 1 MiB

/// Ensures that the specified path is stripped of the leading slash (if any)
/// so that it can be passed to cap_std functions.
fn fix_path<P: AsRef<Path>>(path: &P) -> &Path {
    let path = path.as_ref();
    path.strip_prefix("/").unwrap_or(path)
}

/// UnverifiedFile is a wrapper around cap_std::fs::File that prevents reading
/// the file contents until size verification has been performed via the
/// verify() method.
pub struct UnverifiedFile(cap_std::fs::File);

impl UnverifiedFile {
    /// Returns a reader limited to `max_size` bytes (1 MiB when `None`) after
    /// checking that the file is a regular file no larger than that limit.
    pub fn verify(&self, max_size: Option<u64>) -> io::Result<impl Read + '_> {
        size_verified_reader(&self.0, max_size)
    }

    /// Returns the file itself for streaming decoders that bound their own
    /// memory use, after checking that it is a regular file.
    pub fn into_stream(self) -> io::Result<cap_std::fs::File> {
        if !self.0.metadata()?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(self.0)
    }
}

#[derive(Debug)]
pub enum DocumentError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl SubDirFs {
    /// Creates a new SubDirFs rooted at the specified path
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root_path = root.as_ref().to_path_buf();
        let dir = Dir::open_ambient_dir(root.as_ref(), cap_std::ambient_authority())?;
        Ok(Self { dir, root_path })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Opens a file for reading, returning an UnverifiedFile.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> io::Result<UnverifiedFile> {
        let fixed = fix_path(&path);
        let file = self.dir.open(fixed)?;
        Ok(UnverifiedFile(file))
    }

    /// Gets metadata for a file or directory, following symbolic links as
    /// long as they stay below the root. An empty path is the root itself.
    pub fn metadata<P: AsRef<Path>>(&self, path: P) -> io::Result<cap_std::fs::Metadata> {
        let fixed = fix_path(&path);
        if fixed.as_os_str().is_empty() {
            self.dir.dir_metadata()
        } else {
            self.dir.metadata(fixed)
        }
    }

    /// Gets metadata without following a symbolic link in the last path
    /// component.
    pub fn symlink_metadata<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> io::Result<cap_std::fs::Metadata> {
        let fixed = fix_path(&path);
        if fixed.as_os_str().is_empty() {
            self.dir.dir_metadata()
        } else {
            self.dir.symlink_metadata(fixed)
        }
    }

    /// Reads a symbolic link
    ///
    /// We don't expose read_link because it returns an error if the link target
    /// is an absolute path.
    pub fn read_link_contents<P: AsRef<Path>>(&self, path: P) -> io::Result<PathBuf> {
        let fixed = fix_path(&path);
        self.dir.read_link_contents(fixed)
    }

    /// Reads a directory. An empty path reads the root itself.
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<cap_std::fs::ReadDir> {
        let fixed = fix_path(&path);
        if fixed.as_os_str().is_empty() {
            self.dir.entries()
        } else {
            self.dir.read_dir(fixed)
        }
    }

    /// Reads and deserializes a JSON document of at most `max_size` bytes.
    pub fn read_document<T, P>(&self, path: P, max_size: Option<u64>) -> Result<T, DocumentError>
    where
        T: DeserializeOwned,
        P: AsRef<Path>,
    {
        let file = self.open(path).map_err(DocumentError::Io)?;
        let reader = file.verify(max_size).map_err(DocumentError::Io)?;
        serde_json::from_reader(io::BufReader::new(reader)).map_err(DocumentError::Json)
    }
}

/// Returns a reader for the file after ensuring that the file is a regular file
/// and that the size that can be read from the reader will not exceed a
/// pre-defined safety limit to control memory usage.
pub fn size_verified_reader(
    file: &cap_std::fs::File,
    max_size: Option<u64>,
) -> io::Result<impl Read + '_> {
    let metadata = file.metadata()?;

    let max_size = max_size.unwrap_or(MAX_PARSE_FILE_SIZE);

    // Don't try to read device files, etc.
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }

    let size = metadata.len();
    if size > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("file too large ({} bytes)", size),
        ));
    }

    // Additional limit the reader to avoid surprises if the file size changes
    // while reading it (TOCTOU protection)
    Ok(file.take(size.min(max_size)))
}
