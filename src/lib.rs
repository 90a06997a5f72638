//! Client-side session and synchronization layer for the task board.
//!
//! - [`session`]: credential pair, renewal, sign-out signal.
//! - [`gateway`]: bearer attachment with a single renew-and-replay.
//! - [`mutation`]: optimistic edits with per-entity ordering and rollback.
//! - [`tasks`] and [`users`]: board and directory operations over the store.
//! - [`notifications`]: polled feed merged with sticky local read state.
pub mod api;
pub mod client;
pub mod commands;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod model;
pub mod mutation;
pub mod notifications;
pub mod session;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod users;

pub use context::AppContext;
pub use error::SyncError;
