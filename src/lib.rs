//! Logscope: paged and live log browsing against a remote log backend.

mod cli;
pub mod colors;
pub mod logscope_batch;
pub mod logscope_core;
pub mod logscope_fetch;
pub mod logscope_http;
pub mod logscope_session;
pub mod logscope_store;
pub mod logscope_tui;
pub mod logscope_window;
pub mod sanitize;

pub use cli::{run, DynError};
