//! Environment Management Module
//!
//! Provisions the software environments jobs run in: conda
//! environments through micromamba and singularity container images.

pub mod conda;
pub mod container;

pub use conda::{containerfile, CondaEnv, MICROMAMBA_PATH};
