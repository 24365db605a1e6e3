//! Fault-tolerant distribution and checkpointed processing of
//! utility-meter readings.
//!
//! A [`dispatcher::Dispatcher`] splits each batch into a minority and
//! a majority share and hands them to up to two processing units,
//! failing over to the passive unit when the active one signals a
//! breakdown. Each [`unit::Unit`] runs its share through the
//! validation, normalization and transformation stages of a
//! [`pipeline::Pipeline`], checkpointing after every stage so that a
//! restarted unit can work out where a crashed one stopped and finish
//! the batch.

#[macro_use]
pub(crate) mod macros;

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod filters;
pub mod logging;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod record;
pub mod recovery;
pub mod unit;
pub mod webserver;
pub mod wire;
