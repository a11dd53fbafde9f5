//! LEX Altius: case, stage and payment workflow for law firms.
//!
//! The [`legal::Workflow`] service owns every business rule. It runs over any
//! [`db::Database`] backend and is exposed over HTTP by [`web`].

pub mod config;
pub mod db;
pub mod error;
pub mod legal;
pub mod settings;
pub mod web;

#[cfg(all(test, feature = "libsql"))]
mod testing;
