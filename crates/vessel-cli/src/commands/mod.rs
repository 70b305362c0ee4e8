//! CLI command implementations

pub mod demo;
pub mod info;
pub mod inspect;
pub mod run;
