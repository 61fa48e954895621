#![forbid(unsafe_code)]

//! Job lifecycle and status-polling protocol for turning video links into
//! downloadable audio files.
//!
//! A caller submits a source URL and receives a job id straight away. The
//! conversion runs in the background on a [`backend::ConversionBackend`];
//! callers poll [`service::JobService::status`] (or the HTTP status route)
//! until the job completes or fails, then fetch the artifact.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod hosted;
pub mod job;
pub mod jobdb;
pub mod poller;
pub mod protocol;
pub mod security;
pub mod service;
pub mod source;
pub mod store;
pub mod ytdlp;
