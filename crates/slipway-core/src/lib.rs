pub mod config;
pub mod duration;
pub mod image;
pub mod name;
pub mod types;

pub use config::SlipwayConfig;
pub use duration::parse_duration;
pub use image::{ImageError, ImageRef};
pub use name::{NameError, validate_project_name, validate_version_label};
pub use types::*;
