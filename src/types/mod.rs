//! Type definitions

pub mod job;
pub mod messages;
pub mod optimization;
pub mod route;
pub mod stop;

pub use job::*;
pub use messages::*;
pub use optimization::*;
pub use route::*;
pub use stop::*;
