pub mod driver;
pub mod error;
pub mod format;
pub mod jsonl;
pub mod mock;
pub mod sink;
pub mod store;
pub mod subscriptions;

pub use driver::SessionDriver;
pub use error::DriverError;
pub use jsonl::{JsonlDecoder, JsonlDecoderFactory};
pub use sink::{ReplySink, SendError};
pub use store::{Session, SessionStore};
pub use subscriptions::SubscriptionRegistry;
