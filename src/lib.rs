pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod util;
