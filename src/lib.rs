use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod analyzer;
pub mod builder;
pub mod common;
pub mod config;
pub mod convert;
pub mod database;
pub mod dataset;
pub mod embedder;
pub mod error;
pub mod graph;
pub mod inspector;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod stype;

pub use error::{Error, Result};
