//! Behaviour tests for the service lifecycle.

mod lifecycle;
mod support;
