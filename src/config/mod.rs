/// TOML application settings
pub mod settings;

pub use settings::{Config, ContextConfig, IngestionConfig, PipelineConfig, UnifierConfig};
