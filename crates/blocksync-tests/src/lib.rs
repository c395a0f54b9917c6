//! Scenario tests for the block synchronization engine.
//!
//! The tests under `tests/` drive planner, scheduler, snapshot builder and
//! validation pipeline together against the in-memory chain index and
//! scripted peers from [`helpers`].

pub mod helpers;
