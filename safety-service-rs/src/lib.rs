//! Safety gate for generated commands.
//!
//! The gate looks only at the safety level declared by the code-generation
//! oracle and at the session policy. It never inspects the command text and
//! has no side effects, so the same answer comes back for the same inputs on
//! both the local and the remote path.

mod classifier;

pub use classifier::{decide, decide_unattended, Decision, SafetyPolicy, UnattendedDecision};
