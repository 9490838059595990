pub mod backfill;
pub mod poller;
pub mod retry;
pub mod schedule;
pub mod source;

pub use backfill::Backfill;
pub use poller::LivePoller;
pub use retry::Cancelled;
