mod loader;
mod root;
mod timeout;

pub use loader::{load_from_path, validate_config};
pub use root::Config;
pub use timeout::TimeoutConfig;
