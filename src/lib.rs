// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive buffer pool for the Homa transport protocol.

#[macro_use]
mod macros;

pub mod clock;
pub mod message;
pub mod pool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use message::Message;
pub use pool::{Config, Error, Pool, Region};
