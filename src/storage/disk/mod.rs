pub mod buffer_descriptor;
pub mod disk_io_mgr;
pub(crate) mod disk_queue;
pub mod file_system;
pub mod reader_cache;
pub(crate) mod reader_context;
pub mod scan_range;

pub use buffer_descriptor::BufferDescriptor;
pub use disk_io_mgr::{DiskIoMgr, NextBuffer};
pub use file_system::{FileSystem, LocalFileSystem, ReadSeek};
pub use reader_cache::ReaderHandle;
pub use scan_range::{ScanRange, ScanRangeGroup, ScanRangeMetaData};
