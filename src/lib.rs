//! banwatch - log watching core of an intrusion-prevention daemon.
//!
//! Log sources feed lines to a per-jail [`filter::Filter`], which finds
//! timestamps, matches failure patterns, skips ignored addresses and hands
//! failures to a [`failmanager::FailManager`]. Once an identity reaches
//! `max_retry` failures within `find_time`, a ticket is queued for banning.

pub mod addr;
pub mod cache;
pub mod clock;
pub mod config;
pub mod datedetector;
pub mod error;
pub mod failmanager;
pub mod filter;
pub mod metrics;
pub mod source;
pub mod worker;
