// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod app;
pub mod application;
pub mod client;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod metadata;
pub mod notify;
pub mod runtime;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod telemetry;

pub use application::{AppError, Applied, Application, UpdateBatch};
pub use client::{ClientError, ReplicatedClient};
pub use config::NodeConfig;
pub use consensus::{ConsensusEngine, ConsensusError, LocalCluster, LocalNode, OnDiskStateMachine, RaftContext};
pub use errors::{Phase, StateMachineError};
pub use runtime::{Runtime, RuntimeError};
pub use state_machine::StateMachine;
pub use store::{DurableStore, MemoryStore};
