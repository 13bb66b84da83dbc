pub mod error;
pub mod ffmpeg;
pub mod hls;
pub mod ondemand;
pub mod position;
pub mod session;

pub use error::{SessionError, SessionResult};
pub use session::manager::SessionManager;
