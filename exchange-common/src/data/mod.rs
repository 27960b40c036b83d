// exchange-common/src/data/mod.rs

pub mod book;
pub mod math;
pub mod store;
pub mod types;

pub use store::{ChangeCommand, MemoryStore};
pub use types::*;
