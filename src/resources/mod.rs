//! Resource orchestrators.
//!
//! Each module binds the generic [`Orchestrator`](crate::orchestrator::Orchestrator)
//! steps to one cloud resource: its endpoints, status vocabulary and the
//! error codes meaning "absent" or "busy".

pub mod css;
pub mod dcs;
pub mod iotda;
pub mod logstash;
