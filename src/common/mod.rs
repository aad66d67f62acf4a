//! Common types, traits, and error definitions for bicycle_mpc
//!
//! This module provides the foundational building blocks shared by the
//! path, vehicle, control and simulation modules.

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
