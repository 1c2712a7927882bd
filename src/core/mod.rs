#![forbid(unsafe_code)]

pub mod assignment;
pub mod audit;
pub mod charging;
pub mod dispatcher;
pub mod entity;
pub mod worker;
