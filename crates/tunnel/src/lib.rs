mod bus;
mod direct;
mod http;
mod provider;
mod registry;
mod stream;

pub use bus::{Event, EventBus};
pub use direct::DirectProvider;
pub use http::{HttpConnectProvider, HttpConnectSettings};
pub use provider::{
    DIRECT_ID, DatagramConn, DialError, InboundHandler, ProxyStream, RawForwarder,
    TunnelProvider, TunnelState,
};
pub use registry::{TunnelEntry, TunnelRegistry};
pub use stream::PrefixedStream;
