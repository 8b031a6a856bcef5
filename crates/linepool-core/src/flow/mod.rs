//! Executor interface and the linear reference executor.
//!
//! ```text
//!   FlowCreateArgs ──> builder ──> Box<dyn FlowExecutor>
//!                                        │ exec_line(inputs, run_id, index, timeout)
//!                                        v
//!                             FlowExecutionContext (one per line)
//!                                        │ invoke_node / bypass_node
//!                          ┌─────────────┼──────────────┐
//!                          v             v              v
//!                    ToolDescriptor   RunTracker   CacheManager
//! ```

mod context;
mod executor;
mod linear;
mod tool;

pub use context::FlowExecutionContext;
pub use executor::{FlowCreateArgs, FlowExecutor};
pub use linear::{ActivateCondition, FlowNode, InputBinding, LinearFlow};
pub use tool::{ParamSpec, ToolDescriptor, ToolError, ToolOutput, ValueType};
