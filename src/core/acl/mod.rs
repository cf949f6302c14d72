// src/core/acl/mod.rs

pub mod rules;

pub use rules::{evaluate, AclRule};
