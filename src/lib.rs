//! # email-outbox
//!
//! Database-backed outbox for pending emails. Any number of workers can
//! claim from it concurrently; each claim selects and row-locks one email
//! inside the worker's transaction, and no claim ever waits on another
//! worker's lock.
//!
//! Two claim strategies share the [`outbox::Outbox`] contract:
//! native `FOR UPDATE SKIP LOCKED` ([`outbox::SkipLockedOutbox`]) and a
//! server-side `FOR UPDATE NOWAIT` probing loop ([`outbox::ProbeOutbox`]).
//! Both run on Postgres; with the `oracle` feature the probing loop also
//! runs on Oracle as PL/SQL (`outbox::OracleOutbox`).

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod outbox;
pub mod telemetry;
pub mod worker;
