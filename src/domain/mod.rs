pub mod chain;
pub mod distribution;
pub mod position;
pub mod state;

pub use chain::*;
pub use distribution::*;
pub use position::*;
pub use state::*;
