/// 反向隧道核心：connector、隧道与池
mod connector;
mod pool;
#[allow(clippy::module_inception)]
mod tunnel;

pub use connector::{Connector, ConnectorOptions};
pub use pool::{ConnectorPool, DEFAULT_SWEEP_INTERVAL};
pub use tunnel::{Tunnel, DEFAULT_TTL};
