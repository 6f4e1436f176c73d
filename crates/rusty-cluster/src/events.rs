use rusty_cluster_core::JobError;

/// Notifications broadcast by a running cluster.
#[derive(Debug, Clone)]
pub enum ClusterEvent<D> {
    /// A job was accepted into the queue.
    Queued { data: D },
    /// An attempt of a `queue` job failed. Emitted for every failure,
    /// whether or not the job will be retried.
    TaskError { error: JobError, data: D },
}

impl<D> ClusterEvent<D> {
    pub fn data(&self) -> &D {
        match self {
            Self::Queued { data } | Self::TaskError { data, .. } => data,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queue",
            Self::TaskError { .. } => "taskerror",
        }
    }
}
