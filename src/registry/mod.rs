//! 能力注册表与参数校验

mod registry;
pub mod schema;

pub use registry::{Capability, CapabilityRegistry, Collision, SharedRegistry};
