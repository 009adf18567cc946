pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod storage;
