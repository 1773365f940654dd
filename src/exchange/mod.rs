//! Exchange connectivity.
//!
//! The engine talks to venues through the [`ExchangeConnector`] trait,
//! injected at construction. [`PaperConnector`] is the in-memory
//! implementation used by the demo binary and the test suites.

mod paper;
mod traits;

pub use paper::{PaperConnector, RandomWalk};
pub use traits::ExchangeConnector;
