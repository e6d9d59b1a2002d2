//! Bootstrap handshake of a new host.
//!
//! The host runs a served script that reports steps 1 to 3 through a
//! signed callback URL. Completing step 3 queues the stack provisioning
//! job, which runs steps 4 to 8 over SSH.

mod script;
mod service;
pub mod signed_url;
mod stack;
mod steps;

pub use script::{read_public_key, render_bootstrap_script, ScriptInput};
pub use service::{Provisioner, Registration, StepReport};
pub use signed_url::{SignatureError, UrlSigner};
pub use stack::run_stack_provisioning;
pub use steps::{ProvisionStep, StepMap, StepStatus, LAST_HOST_STEP, STEP_COUNT};
