//! # conway-core: board engine for the shared Life server
//!
//! - [`engine`]: the `StateEngine` contract the sync layer drives
//! - [`life`]: Conway's Game of Life implementation of that contract

pub mod engine;
pub mod life;

pub use engine::{MutationError, StateEngine};
pub use life::{BoardSnapshot, GameSettings, LifeGame, Point, MAX_DIMENSION};
