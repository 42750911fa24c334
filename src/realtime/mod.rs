pub mod ddl;
pub mod hub;
pub mod listener;
pub mod protocol;

pub use hub::SubscriptionHub;
pub use listener::{ChangeListener, NOTIFY_CHANNEL};
pub use protocol::{ChangeEvent, ChangeOperation, ClientMessage, ServerMessage};
