//! Video captioning pipeline
//!
//! Turns a submitted video into a captioned copy through four leased stages
//! (audio extraction, transcription, caption rendering, compositing). Workers
//! coordinate through a job store, share transcripts through a
//! fingerprint-keyed cache and expose progress over a small HTTP API.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
