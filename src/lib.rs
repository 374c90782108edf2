//! PCM Streamer Library
//!
//! Real-time PCM rate conversion and streaming core.

pub mod audio;
pub mod decode;
pub mod engine;
pub mod resample;
