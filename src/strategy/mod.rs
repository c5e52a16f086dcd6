//! Trading strategy: EMA price target and the buy-limit grid around it.
//!
//! Both halves are pure functions. The engine feeds closes into [`ema::ema`],
//! then hands the target to [`grid::build_grid`].

pub mod ema;
pub mod grid;

pub use ema::ema;
pub use grid::{build_grid, GridParams};
