//! Protocol types shared by the device and event hub clients
//!
//! - [`value`] - tagged dynamic values with fallible conversions
//! - [`message`] - AMQP messages and the status-code response convention
//! - [`event`] - device events and quality of service
//! - [`addresses`] - well-known node addresses and link filters

pub mod addresses;
pub mod event;
pub mod message;
pub mod value;

pub use addresses::{AddressBuilder, LinkFilter};
pub use event::{Event, Qos};
pub use message::{check_correlation, check_response, Message, MessageProperties};
pub use value::{Mapping, Value};
