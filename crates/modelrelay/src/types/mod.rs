pub mod attempt;
pub mod channel;
pub mod context;
pub mod principal;
pub mod usage;

pub use attempt::{Attempt, Outcome, Usage};
pub use channel::{Channel, ChannelId, ChannelStatus, ChannelType, Credential};
pub use context::{IngressShape, ReasoningFormat, RelayMode, RelayOptions, RequestContext};
pub use principal::{Token, TokenId, TokenStatus, User, UserId};
pub use usage::UsageRecord;
