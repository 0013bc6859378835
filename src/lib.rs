//! Keep a local stack of commits in sync with one remote branch and one pull
//! request per commit.

pub mod config;
pub mod git;
pub mod git2_ops;
pub mod github;
pub mod identity;
pub mod pool;
pub mod remote;
pub mod review;
pub mod rewrite;
pub mod session;
pub mod stack;
pub mod stats;
pub mod sync;
