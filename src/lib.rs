// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! concord-kernel: the deterministic data model shared by every replica.
//!
//! Nothing in this crate touches I/O, clocks or randomness. Every type here
//! either crosses the replicated log or is derived from something that did,
//! so two replicas fed the same log must build byte-identical values.

pub mod error;
pub mod command;
pub mod entry;
pub mod metadata;
pub mod subscription;

pub use command::CommandEnvelope;
pub use entry::{Entry, EntryResult};
pub use error::{KernelError, KernelResult};
pub use metadata::Metadata;
pub use subscription::{StartSubscription, SubscriptionId, SubscriptionStarted};

#[cfg(test)]
pub mod tests;
