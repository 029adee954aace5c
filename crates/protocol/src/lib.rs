pub mod candidate;
pub mod config;
pub mod messages;

pub use candidate::*;
pub use config::*;
pub use messages::*;
