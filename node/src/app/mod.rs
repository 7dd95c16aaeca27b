// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Applications shipped with the node.

pub mod stream;

pub use stream::{Event, PostEvent, Posted, StreamAnswer, StreamApp, StreamEffect, StreamQuery};
