pub mod disk_manager;
pub mod heap;

pub use disk_manager::DiskManager;
pub use heap::{heap_insert, HeapTid};
