//! Process tracking: registry, port allocation, shutdown, health, logs.

mod health;
mod logs;
mod ports;
mod registry;
mod shutdown;

pub use health::{pid_alive, wait_for_engine_ready};
pub use logs::LogRing;
pub use ports::{allocate_port, is_port_available, PORT_RANGE_END, PORT_RANGE_START};
pub use registry::{ProcessRecord, ProcessRegistry, ProcessStatus};
pub use shutdown::shutdown_child;
