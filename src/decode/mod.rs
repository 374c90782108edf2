//! 解码模块
//!
//! 把音频文件解码为 PCM 字节块，供命令行前端喂给音频源

pub mod decoder;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
