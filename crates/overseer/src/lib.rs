//! In-memory filesystem observation core.
//!
//! A watched root is represented by an in-memory tree of directory and file
//! nodes plus a recency-ordered list of files. A notify thread drains the OS
//! event source into a coalescing pending-change collection, and an IO thread
//! applies those changes to the tree (crawling, stat reconciliation, deletion
//! propagation and desync recovery). Queries synchronize with the filesystem
//! through cookie files, then run generators over the tree and render fields
//! for each matching file.
//!
//! The RPC surface, config-file discovery, daemonization and trigger
//! processes live outside this crate; [`Service`] and [`Root`] are the
//! integration points they build on.

#![allow(clippy::mutable_key_type)]

pub mod caches;
pub mod clock;
pub mod config;
pub mod cookies;
mod engine;
pub mod errors;
mod fileinfo;
mod ignore;
mod name;
mod path_map;
pub mod pending;
mod publisher;
pub mod query;
pub mod root;
mod service;
pub mod subscription;
pub mod view;
pub mod watcher;

pub use crate::{
    clock::{ClockId, ClockPosition, ClockStamp, QuerySince, SinceSpec},
    config::Config,
    engine::InMemoryView,
    errors::{CacheError, CookieSyncError, QueryExecError, QueryParseError, RootError},
    fileinfo::{DType, FileInformation},
    name::Name,
    publisher::{Publisher, SubscriberQueue},
    query::{Query, QueryResult},
    root::{CaseSensitivity, Root},
    service::Service,
};
