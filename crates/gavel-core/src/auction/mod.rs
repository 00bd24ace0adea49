// Auction core: records, bid engine, derived groupings and the progression
// state machine.

pub mod bid;
pub mod error;
pub mod grouping;
pub mod model;
pub mod progression;

pub use error::ValidationError;
pub use model::*;
pub use progression::{compute_phase, Phase};
