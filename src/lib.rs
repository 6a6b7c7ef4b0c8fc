//! Object-level permission resolution and document workflow engine.
//!
//! Two cooperating subsystems: an ACL engine that answers "which rows may
//! this user act on" by compiling the registered inheritance graph into SQL
//! filters, and a workflow state machine that moves documents through
//! user-defined states with an append-only history.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod permissions;
pub mod services;
