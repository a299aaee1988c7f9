//! Host internals for the switchboard binary.
//!
//! The composition root lives in [`service`]; everything else is a layer it
//! wires together: the per-message pipeline ([`agent`]), the concurrency core
//! ([`tasks`], [`convlock`]), the health subsystem ([`health`]) and the
//! browser surface ([`web`]).

pub mod agent;
pub mod convlock;
pub mod health;
pub mod service;
pub mod tasks;
pub mod web;
