pub mod channels;
pub mod lineups;

pub use channels::{ChannelRepository, JsonChannelRepository};
pub use lineups::LineupStore;
