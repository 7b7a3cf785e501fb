pub mod link;
pub mod scanner;

pub use link::{
    BondState, Connector, DeviceAddress, GattService, Link, LinkError, LinkEvent, LinkEvents,
    LinkResult, SubscribeMode,
};
pub use scanner::{Advertisement, Scanner};

#[cfg(test)]
pub use link::MockConnector;
#[cfg(test)]
pub use scanner::MockScanner;
