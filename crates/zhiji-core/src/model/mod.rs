mod event;
mod plan;
mod session;
mod user;

pub use event::*;
pub use plan::*;
pub use session::*;
pub use user::*;

/// Local wall-clock time in the `%Y-%m-%d %H:%M:%S` form used for events
/// and memory entries.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// RFC 3339 timestamp, used for messages and plan bookkeeping.
pub fn iso_now() -> String {
    chrono::Local::now().to_rfc3339()
}
