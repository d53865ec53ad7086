/*!
 * Monitoring
 * Structured tracing setup and spans around blocking waits
 */

mod tracer;

pub use tracer::{init_tracing, span_wait, WaitSpan};
