// gale-common: shared infrastructure for the gale workflow runner.
// Everything here is independent of the workflow model and the job runtime.

pub mod action_command;
pub mod executor;
pub mod logging;
pub mod process_invoker;
pub mod secret_masker;
pub mod task_result;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use action_command::ActionCommand;
pub use executor::{Cancelled, Executor, Scope};
pub use logging::RunLogger;
pub use process_invoker::{OutputLine, OutputSender, OutputStream, ProcessInvoker};
pub use secret_masker::SecretMasker;
pub use task_result::TaskResult;
