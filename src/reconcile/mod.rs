pub mod controller;
pub mod state;

pub use controller::{ActionOutcome, LotController, LotEvent};
pub use state::{LotView, LotViewState, SpotView};
