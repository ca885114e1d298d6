//! PHP runtime integration
//!
//! Overrides from a descriptor fall into two classes. Pool-scope
//! directives go into the project's own worker pool file. Host-global
//! directives can only take effect in the runtime's global ini scan
//! directory, which every project on that PHP version shares, so one
//! project at a time owns that file.

pub mod pool;
pub mod settings;
pub mod system_ini;

pub use pool::PoolManager;
pub use settings::{split, IniSplit};
pub use system_ini::{ActivationState, ClaimOutcome, SystemIniArbiter, SystemIniOwner};
