//! Health probing and monitoring

mod monitor;
mod probe;

pub use monitor::{HealthAction, HealthCheckReport, HealthMonitor};
pub use probe::{
    probe_for, CustomProbe, HealthProbe, HttpProbe, ProbeResult, ProbeStatus, ProbeTarget,
    TcpProbe,
};
