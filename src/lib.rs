pub mod cache;
pub mod captions;
pub mod config;
pub mod domain;
pub mod drive;
pub mod error;
pub mod failed;
pub mod fs_util;
pub mod handlers;
pub mod http;
pub mod media;
pub mod metadata;
pub mod output;
pub mod pipeline;
pub mod settings;
pub mod store;
pub mod video_host;
