//! Scheduling Module
//!
//! Turns channel data into runnable work.
//!
//! - [`input_manager`]: matches ready input data into input sets

pub mod input_manager;

pub use input_manager::{InputError, InputItem, InputManager, InputSet};
