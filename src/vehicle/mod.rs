//! Vehicle models

pub mod bicycle_model;

pub use bicycle_model::{BicycleModel, TrackingError, TrackingErrorJacobian, VehicleParams};
