// gale-model: the typed workflow model, YAML parsing with collected load
// errors, matrix expansion, and the event/job planner.

pub mod event;
pub mod matrix;
pub mod planner;
pub mod workflow;

pub use matrix::{Matrix, MatrixAssignment};
pub use planner::{Plan, Planner, Run, Stage};
pub use workflow::{
    read_workflow, ActionReference, ContainerSpec, Job, Step, StepExec, Strategy, Workflow,
    WorkflowError,
};
