pub mod append;
pub mod builder;
pub mod config;
pub mod custody;
pub mod error;
mod exec;
pub mod list;
pub mod mounts;
pub mod pipeline;
pub mod validate;

pub use config::{HashAlgo, Profile};
pub use error::{Error, Result};
