//! Placement errors.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no eligible node for strategy kind {0}")]
    NoEligibleNode(String),

    #[error("node cache is closed")]
    CacheClosed,
}
