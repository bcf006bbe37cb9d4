mod policy;
mod record;
mod state;

pub use policy::{PollSchedule, RetryPolicy};
pub use record::{
    AudioPayload, AudioReference, ChatRef, JobId, JobRecord, JobReport, JobResult, OperationHandle,
};
pub use state::{JobState, StageReport, StateMachine, Transition};
