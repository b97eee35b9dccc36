pub mod background;
pub mod buffer;
pub mod config;
pub mod database;
pub mod error;
pub mod recovery;
pub mod storage;
pub mod transaction;
pub mod utils;
