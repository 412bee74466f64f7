//! Scrape request parameters and their validation.

use serde::{Deserialize, Serialize};

/// Smallest accepted grid size (one search zone per zoom level).
pub const MIN_GRID_SIZE: u32 = 1;
/// Largest accepted grid size.
pub const MAX_GRID_SIZE: u32 = 55;
/// Grid size used when the request does not specify one.
pub const DEFAULT_GRID_SIZE: u32 = 4;

const MIN_TEXT_LEN: usize = 2;

fn default_grid_size() -> u32 {
    DEFAULT_GRID_SIZE
}

/// What to scrape: a business activity in a city, over an N×N search grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeQuery {
    pub activity: String,
    pub city: String,
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("activity must be at least {MIN_TEXT_LEN} characters")]
    ActivityTooShort,

    #[error("city must be at least {MIN_TEXT_LEN} characters")]
    CityTooShort,

    #[error("grid_size must be between {MIN_GRID_SIZE} and {MAX_GRID_SIZE}, got {0}")]
    GridSizeOutOfRange(u32),
}

impl ScrapeQuery {
    pub fn new(activity: impl Into<String>, city: impl Into<String>, grid_size: u32) -> Self {
        Self {
            activity: activity.into(),
            city: city.into(),
            grid_size,
        }
    }

    /// Check the query before any worker is spawned for it.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.activity.trim().chars().count() < MIN_TEXT_LEN {
            return Err(ValidationError::ActivityTooShort);
        }
        if self.city.trim().chars().count() < MIN_TEXT_LEN {
            return Err(ValidationError::CityTooShort);
        }
        if !(MIN_GRID_SIZE..=MAX_GRID_SIZE).contains(&self.grid_size) {
            return Err(ValidationError::GridSizeOutOfRange(self.grid_size));
        }
        Ok(())
    }

    /// Trailing worker arguments: `<activity> <city> <grid_size>`.
    pub fn worker_args(&self) -> [String; 3] {
        [
            self.activity.trim().to_string(),
            self.city.trim().to_string(),
            self.grid_size.to_string(),
        ]
    }
}
