//! Woodpeckers: a randomized drinking-bird controller built on a portable,
//! single-threaded readiness reactor.
//!
//! The [`reactor`] module is the heart of the crate and is usable on its own;
//! [`config`], [`output`] and [`controller`] form the application layered on
//! top of it.

pub mod config;
pub mod controller;
pub mod output;
pub mod reactor;

pub use crate::config::{BirdSpec, Config, ConfigError, OutputKind, OutputSpec, Settings};
pub use crate::controller::{Controller, ControllerError};
pub use crate::output::Output;
pub use crate::reactor::{EventId, Reactor, ServerDescriptor};
