//! Model definitions for the gradvae workspace.
pub mod models;
