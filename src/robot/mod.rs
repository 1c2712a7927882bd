#![forbid(unsafe_code)]

pub mod link;
pub mod model;
pub mod registry;
