// Error taxonomy shared by the mapping layer and both pool engines.
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use libc::{EEXIST, EINVAL, ENOENT, ENOSPC};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    OutOfSpace,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    block: Option<u64>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            block: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(block) = self.block {
            write!(f, " (block: {block})")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Maps an OS-level failure onto the engine taxonomy, POSIX-style.
pub fn io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.raw_os_error().unwrap_or_default() {
        ENOENT => ErrorKind::NotFound,
        EEXIST => ErrorKind::AlreadyExists,
        EINVAL => ErrorKind::InvalidArgument,
        ENOSPC => ErrorKind::OutOfSpace,
        _ => match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Io,
        },
    }
}

pub fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Error {
    Error::new(io_error_kind(&err))
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, io_error_kind};

    #[test]
    fn errno_mapping_is_stable() {
        let cases = [
            (libc::ENOENT, ErrorKind::NotFound),
            (libc::EEXIST, ErrorKind::AlreadyExists),
            (libc::EINVAL, ErrorKind::InvalidArgument),
            (libc::ENOSPC, ErrorKind::OutOfSpace),
            (libc::EBADF, ErrorKind::Io),
        ];

        for (errno, kind) in cases {
            let err = std::io::Error::from_raw_os_error(errno);
            assert_eq!(io_error_kind(&err), kind);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Io)
            .with_message("read of error-flagged block")
            .with_path("/tmp/pool")
            .with_block(42);
        let rendered = err.to_string();
        assert!(rendered.contains("Io"));
        assert!(rendered.contains("/tmp/pool"));
        assert!(rendered.contains("42"));
    }
}
