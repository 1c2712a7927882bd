#![forbid(unsafe_code)]

pub mod board;
pub mod model;
pub mod priority;
pub mod state;
