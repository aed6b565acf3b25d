//! Round scaffolding shared by keygen and keysign: the engine boundary, the
//! outbound/inbound pumps and the retry policy.

pub mod engine;
pub mod retry;
pub mod round;

pub use engine::{EngineSession, Engines, MpcEngine, SessionHandle};
pub use retry::RetryPolicy;
pub use round::{RoundContext, RoundState, check_committee, run_round};
