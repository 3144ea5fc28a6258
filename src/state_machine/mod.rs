mod record;
mod state;

pub use record::{LifecycleState, ProcessRecord};
pub use state::{NodeState, StateMachine, Transition, Trigger};
