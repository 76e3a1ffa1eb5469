//! Host runtime stand-ins: named channels, badge and open documents.

pub mod documents;
pub mod hub;
pub mod port;

pub use documents::{DocumentId, Documents};
pub use hub::{Hub, Listener};
pub use port::{Port, PortReceiver, PortSender};
