//! Multi-source forecasting: weather providers, blending by crossover
//! day, shadow accuracy tracking, and the frozen daily budget.

pub mod accuracy;
pub mod blend;
pub mod manager;
pub mod weather;

pub use accuracy::{ForecastOutcome, SourceAccuracy};
pub use blend::{BlendedPoint, PredictionContext};
pub use manager::{DailyBudget, ForecastManager, FunnelProjection, ShadowTotals};
pub use weather::{
    GeoLocation, MetNoProvider, SmhiProvider, StaticProvider, WeatherError, WeatherForecast,
    WeatherPoint, WeatherProvider,
};
