//! Task dispatch and the pool façade.

mod dispatcher;
mod facade;
mod queue;

pub use facade::LinePool;
pub use queue::Task;
