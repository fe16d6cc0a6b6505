pub mod allocations;
pub mod credits;
pub mod db;
pub mod health;
pub mod jobs;
pub mod leads;
pub mod leases;
pub mod models;
pub mod proxies;
pub mod schema;
pub mod sessions;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
