//! kiln-testkit
//!
//! In-memory implementations of every engine collaborator, with fault
//! injection, plus a [`Harness`] that wires them into a real
//! `ReconciliationEngine`. No DB or network.
//!
//! All fakes append to a shared [`Journal`] so tests can assert the order in
//! which durable effects happened (e.g. mappings saved before items created).

mod fakes;
mod harness;

pub use fakes::{FakeCommerce, Journal, MemoryMappingStore, MemoryOrderStore};
pub use harness::{line, Harness};
