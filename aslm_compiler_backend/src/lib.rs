pub mod board;
pub mod channel;
pub mod config;
pub mod error;
pub mod template;
pub mod timing;
pub mod utils;
pub mod waveform;

pub use board::*;
pub use channel::*;
pub use config::*;
pub use error::*;
pub use template::*;
pub use timing::*;
pub use utils::*;
pub use waveform::*;
