//! Railbrain models a physical model railroad layout as a graph of
//! blocks and turnouts and continuously decides, for every train, where
//! it is, whether it may advance and along which path it should travel.
//!
//! The [`control`] module contains the whole controlling system: the
//! layout graph and its search engines, the per-train movement handling
//! and the scheduler that drains layout events. The [`general`] module
//! holds the numeric abstractions speed handling is built on.

/// The controlling system: layout graph, search engines, trains and the
/// scheduler.
pub mod control;
/// General numeric abstractions used by the speed handling.
pub mod general;
