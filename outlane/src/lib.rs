//! The outlane process: configuration loading and the controller that runs
//! one delivery lane per configured zone.

pub mod controller;
