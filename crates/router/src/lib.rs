mod classify;
mod qos;
mod router;
mod writer;

pub use classify::{Decision, FlowVerdict};
pub use qos::{EgressClass, egress_class, packet_class, tos_for};
pub use router::{Router, RouterParams, TunAdapter};
pub use writer::{TunSink, TunWriter, TunWriterHandle, tun_writer};
