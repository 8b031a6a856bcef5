//! Worker process supervision.

pub mod logs;
mod manager;
pub mod os;

pub use manager::ProcessManager;
