//! Scenario tests for whole pipeline runs

#[path = "../common/mod.rs"]
mod common;

mod caching;
mod failure_handling;
mod immutability;
mod lineage;
mod parallel;
