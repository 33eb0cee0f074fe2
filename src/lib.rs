//! Thermodynamic learning and forecasting engine for building heating.
//!
//! The crate learns a building's heating energy signature online from
//! metered consumption and weather, bucketed by effective temperature,
//! wind severity, and auxiliary-heat state, and uses the learned models
//! to estimate current demand, project daily budgets, and score two
//! competing weather forecast feeds against each other.

pub mod auxiliary;
pub mod config;
pub mod domain;
pub mod engine;
pub mod forecast;
pub mod io;
pub mod learning;
pub mod model;
pub mod sensors;
pub mod solar;
pub mod statistics;
pub mod storage;
pub mod telemetry;
pub mod thermal;
pub mod wind;
