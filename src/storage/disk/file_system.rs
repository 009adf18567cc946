use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::Path;

/// A seekable byte source opened for one scan range.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Opens the files scan ranges point at. A reader registered without one
/// reads through [`LocalFileSystem`].
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn name(&self) -> &str {
        "local"
    }
}
