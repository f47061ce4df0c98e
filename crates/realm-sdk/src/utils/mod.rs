pub mod time;

pub use time::{now_millis, Clock, ManualClock, SharedClock, SystemClock};
