pub mod config;
pub mod context;
pub mod error;
pub mod step;
pub mod types;

pub use config::CadenceConfig;
pub use context::{CancelHandle, Context};
pub use error::{CadenceError, Result};
pub use step::{
    end, start_state, step_fn, End, Failure, FailureKind, OnError, Step, StepRef, Transition,
};
pub use types::RunId;
