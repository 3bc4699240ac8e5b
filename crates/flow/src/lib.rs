mod entry;
mod key;
mod snapshot;
mod table;

pub use entry::{
    FIN_CLIENT, FIN_SERVER, FailoverCtx, RAW_IDLE_SECS, RawFlow, TCP_IDLE_SECS, TcpNat,
    UDP_DNS_IDLE_SECS, UDP_IDLE_SECS, UdpNat,
};
pub use key::{NatKey, RawKey, ShardKey};
pub use snapshot::{PortSet, VpnIpMap};
pub use table::{FlowTable, RawEvictHook, ShardedTable};
