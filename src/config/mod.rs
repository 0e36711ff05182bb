pub mod models;
pub mod parser;

pub use models::{Config, Location, ServerConfig};
pub use parser::parse_config;
