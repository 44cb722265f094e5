#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! Multiple hypothesis tracking (MHT) for multi-target data association.
//!
//! Given a stream of noisy measurement scans, a [`tracker::Tracker`]
//! maintains a forest of track trees representing every plausible
//! explanation of the data — targets starting, continuing, coasting
//! undetected, ending, and spurious false alarms — prunes that forest so it
//! does not explode combinatorially, and, with a delay of a few scans,
//! commits to the single most likely interpretation of each target.
//!
//! The underlying combinatorial engines are usable on their own: an
//! [`assign::Solver`] for minimum-cost bipartite matching with optional
//! unassignments, and a [`murty::RankedAssignments`] queue that enumerates
//! assignment solutions in non-decreasing cost order.

pub mod arena;
pub mod assign;
pub mod cluster;
pub mod error;
pub mod hypo;
pub mod links;
pub mod model;
pub mod murty;
pub mod pqueue;
pub mod report;
pub mod tracker;
pub mod tree;
