pub mod status;
pub mod timeout;

pub use status::LinkStatus;
pub use timeout::{Timeout, TimeoutFlags, TimeoutPolicy};
