//! `mailsummary`: persistent message summaries for local mail folders.
//!
//! This crate keeps a compact binary index of message metadata next to
//! mbox, maildir and MH folders, reconciles that index with the folder
//! contents, writes flag changes back, and provides a sharded on-disk
//! cache for fetched message data.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod file_ops;
pub mod local;
pub mod logging;
pub mod model;
pub mod parser;
pub mod store;
pub mod summary;
