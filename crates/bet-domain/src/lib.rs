pub mod bet;
pub mod errors;
pub mod events;
pub mod ids;
pub mod money;

pub use bet::{Bet, BetStatus};
pub use errors::DomainError;
pub use events::{GatewayEvent, GatewayEventKind};
pub use ids::{BetId, PayeeId, RequestId, TraceId};
pub use money::{Amount, MoneyError};
