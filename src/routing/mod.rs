//! # Routing
//!
//! Task-type to channel resolution. The [`ChannelRegistry`] owns the routing
//! table loaded from configuration; [`TaskKind`] is the closed set of task
//! types the workers can actually process.

mod error;
mod registry;
mod task_kind;

pub use error::RoutingError;
pub use registry::{Channel, ChannelRegistry};
pub use task_kind::TaskKind;
