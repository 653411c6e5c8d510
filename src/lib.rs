//! `spindle` — a gapless audio playback pipeline core.
//!
//! This crate provides:
//! - A [`Playlist`] of decodable files, decoded continuously by one
//!   background worker
//! - [`Sink`]s: consumer endpoints that each declare an exact PCM output
//!   format and drain a bounded queue of shared [`Buffer`]s
//! - A conversion graph (volume, fan-out, per-format conversion) rebuilt
//!   live as sinks attach, formats change, or the volume moves
//! - Seeking, pausing, per-item gain, and a distinct end-of-playlist signal
//!
//! The library is designed for player frontends, encoders, and analyzers to
//! share one decode pass: sinks wanting the same format receive the same
//! buffers, with an emphasis on predictable backpressure and minimal copying.

// Public surface: the playlist, files, sinks, and buffers.
pub mod buffer;
pub mod error;
pub mod file;
pub mod format;
pub mod item;
pub mod playlist;
pub mod sink;

// Logging configuration and control.
pub mod logging;

// Internal machinery: conversion tails, the graph, the worker, the queue.
mod convert;
mod engine;
mod graph;
mod queue;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use file::File;
pub use format::{AudioFormat, ChannelLayout, SampleFormat};
pub use item::ItemId;
pub use playlist::Playlist;
pub use sink::{Sink, SinkConfig, SinkPoll};
