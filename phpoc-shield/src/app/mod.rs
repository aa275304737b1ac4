//! Services the shield firmware provides beyond sockets.

pub mod datetime;
pub mod email;

pub use datetime::DateTime;
pub use email::Email;
