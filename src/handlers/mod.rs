pub mod config;
pub mod frontend;
pub mod speech;

pub use config::*;
pub use frontend::*;
pub use speech::*;
