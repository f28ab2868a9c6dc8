// Engine orchestration — session lifecycle, download and pack coordination.

pub mod archive;
pub mod broadcast;
pub mod cleanup;
pub mod downloader;
pub mod frame;
pub mod registry;
pub mod session;
