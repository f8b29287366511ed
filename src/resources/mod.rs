pub mod cluster;
pub mod workloads;

pub use cluster::{ClusterApi, KubeCluster, WorkloadEvent};
pub use workloads::{Workload, WorkloadKey, WorkloadKind, WorkloadRef};
