pub mod bus;
pub mod command;
pub mod inbox;
pub mod pattern;

pub use bus::{Hub, Subscription};
pub use command::CommandError;
pub use inbox::Inbox;
pub use pattern::{EventFilter, EventPattern};
