//! A client-side request manager for a redirector-driven distributed
//! storage protocol (XRootD-style): it keeps up to two concurrent network
//! sources open for one logical file, measures their running quality,
//! splits vector reads across them proportionally, and replaces
//! underperforming sources by reopening the file through the redirector.
//!
//! The production entry point is [`RequestManager`]; it is generic over a
//! [`Wire`] implementation so it can be exercised without a real protocol
//! client. This crate ships only a [`mock`] wire, used by its own test
//! suite — wiring up a real client binding is left to the consumer.

pub mod fail;
pub mod manager;
pub mod quality;
pub mod request;
pub mod source;
pub mod wire;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use fail::Fail;
pub use manager::{RequestManager, RequestManagerConfig};
pub use quality::{DecayingQualityMetric, FixedQualityMetric, Quality, QualityMetric};
pub use request::{AnyReadFuture, ReadFuture, RequestKind, SplitReadFuture};
pub use source::Source;
pub use wire::{AccessMode, IoOffset, IoSize, IoVec, OpenFlags, Wire, WireHandle, WireStatus};
