mod code;
mod config;
mod error;

pub use code::Code;
pub use config::{Config, Reclaim, TrackerConfig};
pub use error::{functions::*, BindError, ErrorKind};
