pub mod config;
pub mod messages;
pub mod token;

pub use config::*;
pub use messages::*;
pub use token::*;
