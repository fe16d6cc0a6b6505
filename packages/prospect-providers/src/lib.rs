pub mod browser;
pub mod probe;
pub mod search_api;

mod error;

pub use error::{Error, Result};
