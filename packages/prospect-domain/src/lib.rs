pub mod cadence;
pub mod failure;
pub mod health;
pub mod job;
pub mod lead;
pub mod proxy;
pub mod session;
