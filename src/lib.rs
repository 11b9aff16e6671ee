//! fixie-batch — core library
//!
//! A batch execution service for long-running simulations. All
//! authoritative state lives on the filesystem: five status directories
//! whose membership defines each job's status, one detached runner process
//! per job, and rename-based transitions between them. A fresh server
//! process inherits a running fleet by reading the directories.

pub mod cancel;
pub mod env;
pub mod jobstore;
pub mod query;
pub mod runner;
pub mod schema;
pub mod services;
pub mod spawn;
pub mod wait;
