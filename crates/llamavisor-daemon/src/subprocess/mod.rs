//! Inference child process: handle, supervision and input serialization.

pub mod child;
pub mod serializer;
pub mod supervisor;

pub use child::{ChildConfig, ChildHandle, SpawnError};
pub use serializer::{InFlight, PendingRequest, RequestSerializer, SubmitError};
pub use supervisor::{
    ChildDiedError, ProcessSupervisor, RestartPolicy, SupervisorConfig, SupervisorSignals,
    SupervisorState, shutdown_requested,
};
