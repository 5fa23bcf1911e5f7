//! Conway's Game of Life on a wrapping (toroidal) board.
//!
//! Rules are the classic B3/S23: a dead cell with exactly three live
//! neighbours is born, a live cell with two or three survives.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::{MutationError, StateEngine};

/// Largest accepted width or height.
pub const MAX_DIMENSION: usize = 4096;

/// Board dimensions and clock cadence, sent verbatim to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    pub width: usize,
    pub height: usize,
    /// Milliseconds between generations (0 = the board only changes on input)
    pub tick_interval_ms: u64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            width: 50,
            height: 50,
            tick_interval_ms: 1000,
        }
    }
}

/// `ADD_POINT` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u64,
    pub y: u64,
}

/// Serializable view of the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardSnapshot {
    pub generation: u64,
    /// Row-major: `field[y][x]`, 1 = alive
    pub field: Vec<Vec<u8>>,
}

/// The authoritative board.
#[derive(Debug, Clone)]
pub struct LifeGame {
    settings: GameSettings,
    generation: u64,
    cells: Vec<bool>,
}

impl LifeGame {
    /// Create an empty board. Each dimension is clamped to `1..=MAX_DIMENSION`.
    pub fn new(settings: GameSettings) -> Self {
        let settings = GameSettings {
            width: settings.width.clamp(1, MAX_DIMENSION),
            height: settings.height.clamp(1, MAX_DIMENSION),
            ..settings
        };
        Self {
            cells: vec![false; settings.width * settings.height],
            settings,
            generation: 0,
        }
    }

    /// Create a board with the given cells already alive.
    ///
    /// Cells outside the board are skipped with a warning.
    pub fn with_cells(
        settings: GameSettings,
        cells: impl IntoIterator<Item = (usize, usize)>,
    ) -> Self {
        let mut game = Self::new(settings);
        for (x, y) in cells {
            if x < game.settings.width && y < game.settings.height {
                let idx = game.index(x, y);
                game.cells[idx] = true;
            } else {
                log::warn!("Ignoring seed cell ({x}, {y}) outside the board");
            }
        }
        game
    }

    pub fn game_settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the cell at (x, y) is alive. Out-of-range cells are dead.
    pub fn is_alive(&self, x: usize, y: usize) -> bool {
        x < self.settings.width && y < self.settings.height && self.cells[self.index(x, y)]
    }

    pub fn live_count(&self) -> usize {
        self.cells.iter().filter(|alive| **alive).count()
    }

    /// Bring a cell to life. Adding an already-live cell is a no-op.
    pub fn add_point(&mut self, point: Point) -> Result<(), MutationError> {
        let (width, height) = (self.settings.width, self.settings.height);
        if point.x >= width as u64 || point.y >= height as u64 {
            return Err(MutationError::OutOfBounds {
                x: point.x,
                y: point.y,
                width,
                height,
            });
        }
        let idx = self.index(point.x as usize, point.y as usize);
        self.cells[idx] = true;
        Ok(())
    }

    /// Advance one generation.
    pub fn step(&mut self) {
        let (width, height) = (self.settings.width, self.settings.height);
        let mut next = vec![false; self.cells.len()];
        for y in 0..height {
            for x in 0..width {
                let idx = self.index(x, y);
                next[idx] = matches!(
                    (self.cells[idx], self.live_neighbours(x, y)),
                    (true, 2) | (_, 3)
                );
            }
        }
        self.cells = next;
        self.generation += 1;
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let field = self
            .cells
            .chunks(self.settings.width)
            .map(|row| row.iter().map(|alive| u8::from(*alive)).collect())
            .collect();
        BoardSnapshot {
            generation: self.generation,
            field,
        }
    }

    fn index(&self, x: usize, y: usize) -> usize {
        y * self.settings.width + x
    }

    fn live_neighbours(&self, x: usize, y: usize) -> u8 {
        let (width, height) = (self.settings.width, self.settings.height);
        let mut count = 0;
        for dy in wrap_offsets(height) {
            for dx in wrap_offsets(width) {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = (x + dx) % width;
                let ny = (y + dy) % height;
                if self.cells[self.index(nx, ny)] {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Distinct neighbour offsets along one axis of length `len`, modulo `len`.
///
/// Boards narrower than three cells would otherwise count the same
/// neighbour (or the cell itself) twice.
fn wrap_offsets(len: usize) -> impl Iterator<Item = usize> {
    [len - 1, 0, 1].into_iter().take(len.min(3))
}

impl Default for LifeGame {
    fn default() -> Self {
        Self::new(GameSettings::default())
    }
}

impl StateEngine for LifeGame {
    fn state(&self) -> Value {
        let snapshot = self.snapshot();
        json!({
            "generation": snapshot.generation,
            "field": snapshot.field,
        })
    }

    fn settings(&self) -> Value {
        json!({
            "width": self.settings.width,
            "height": self.settings.height,
            "tickIntervalMs": self.settings.tick_interval_ms,
        })
    }

    fn apply_update(&mut self, payload: &Value) -> Result<Value, MutationError> {
        let point = Point::deserialize(payload)
            .map_err(|e| MutationError::InvalidPayload(e.to_string()))?;
        self.add_point(point)?;
        Ok(self.state())
    }

    fn tick(&mut self) -> Option<Value> {
        self.step();
        Some(self.state())
    }
}
