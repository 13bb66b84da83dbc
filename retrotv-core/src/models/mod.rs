pub mod channel;
pub mod id;
pub mod lineup;
pub mod schedule;

pub use channel::{Channel, StreamMode, TranscodeConfig};
pub use id::{generate_token, ChannelId, ProgramId};
pub use lineup::{
    Lineup, LineupItem, LineupUpdate, OnDemandConfig, OnDemandState, PendingProgram, ProgramGroup,
};
pub use schedule::{
    FillMode, FlexPreference, RandomSchedule, RandomSlot, Schedule, SchedulePeriod, SlotOrder,
    SlotProgramming, TimeSchedule, TimeSlot,
};
