pub mod config;
pub mod errors;
pub mod garbage;
pub mod mime;

pub use config::{
    apply_overrides, config_path, load_config, read_password_file, AppConfig, ConfigOverrides,
    OutputFormat,
};
pub use errors::ExchangeError;
pub use garbage::GarbageFiles;
