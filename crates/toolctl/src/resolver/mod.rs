//! C3–C6: dependency classification, install-method selection, choice
//! resolution, and plan assembly. Split into one module per component,
//! mirroring spec.md's own component boundaries.

pub mod choice;
pub mod dep;
pub mod method;
pub mod plan_builder;

pub use plan_builder::{
    diff_for_resume, resolve_choices, resolve_install_plan, resolve_install_plan_with_choices,
};
