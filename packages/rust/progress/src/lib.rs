//! Progress bus and task registry for Oncall Lens.
//!
//! [`TaskRegistry`] owns the mutable state of every analysis task. The
//! pipeline publishes into it; [`Subscription`]s read from it, and
//! [`sse`] frames those reads for an event-stream transport.

mod registry;
pub mod sse;
mod subscription;

pub use registry::TaskRegistry;
pub use subscription::Subscription;
