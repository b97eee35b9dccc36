pub mod latch;
pub mod timestamp;
