mod model;
mod registry;
mod transition;

pub use model::{Channel, ChannelId, ChannelKind, ChannelStatus};
pub use registry::{ChannelRegistry, MemoryChannelRegistry, RegistryError, RegistrySnapshot};
pub use transition::{ChannelStatusTransition, TransitionActor};
