//! Configuration Module
//!
//! Configuration loading for the trade tape service.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, RetrySettings, ServerSettings, SimulatorSettings,
    SizerSettings, TapeConfig, parse_start_point,
};
