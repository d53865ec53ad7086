/*!
 * Bounded Execution
 * Admission-limited submission in front of any task sink
 */

mod bounded;
mod sink;

pub use bounded::{BoundedConfig, BoundedExecutor};
pub use sink::{DirectSink, TaskSink};
