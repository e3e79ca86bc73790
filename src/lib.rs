// ===============================
// src/lib.rs
// ===============================

pub mod clock;
pub mod config;
pub mod domain;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod metrics;
pub mod persist;
pub mod risk;
pub mod strategy;
