pub mod completion;
pub mod config;
pub mod dualstack;
pub mod error;
pub mod resolver;
mod runtime;

pub use completion::{Completion, CompletionSink, OperationKind, Outcome, PendingOperation, Request};
pub use config::SocketConfig;
pub use dualstack::{
    address::{AddressFamily, Endpoint, MappedAddress, SocketKind},
    bidir_socket::BidirSocket,
    pktinfo::{PacketInfo, ReceivedMessage},
    socket::DualStackSocket,
};
pub use error::{Kind, SocketError};
pub use resolver::{AddressResolver, StaticResolver, SystemResolver};
