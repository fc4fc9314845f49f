//! cachemesh-balancer — the front-end request dispatcher.
//!
//! Maps every inbound request to a backend worker through the hash
//! ring and forwards it over loopback HTTP. A companion redistribution
//! loop pulls the manager's server table and reweights the ring from
//! load telemetry.

pub mod dispatcher;
pub mod redistributor;
pub mod table;
pub mod upstream;

pub use dispatcher::{dispatcher_router, DispatcherState};
pub use redistributor::CacheRedistributor;
pub use table::BackendTable;
pub use upstream::{fetch_server_table, forward_request, UpstreamError};
