pub mod error;
pub mod mediator;
pub mod message;
pub mod sequence;
pub mod stats;

pub use error::MediatorError;
pub use mediator::{CacheMediator, Flow, MediatorSettings, OnCacheHit, Role};
pub use message::{CacheContext, Direction, MessageContext, MESSAGE_TYPE_KEY, STATUS_KEY};
pub use sequence::{InlineSequence, Sequence, SequenceRegistry, Step};
pub use stats::{MediatorStats, StatsSnapshot};
