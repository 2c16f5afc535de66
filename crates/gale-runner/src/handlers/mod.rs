// Step handlers: one per step variant, sharing the Handler contract.

pub mod composite_handler;
pub mod container_action_handler;
pub mod handler;
pub mod node_action_handler;
pub mod script_handler;

pub use handler::{ActionContext, Handler, HandlerData};
