//! HTTP to message-queue gateway.
//!
//! Inbound HTTP requests are matched against a configurable route table, turned into signed tickets,
//! published to a worker queue, and re-synchronized with the worker's reply either inline (sync mode)
//! or through a later poll of `/tickets/:id` (async mode).

pub mod attachments;
pub mod broker;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod error;
pub mod gateway_log;
pub mod guard;
pub mod handler;
pub mod ingress;
pub mod proxy;
pub mod routes;
pub mod server;
pub mod ticket;
pub mod token;
pub mod worker;
