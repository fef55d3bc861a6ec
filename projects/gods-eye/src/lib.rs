pub mod cli;
pub mod error;
pub mod event_log;
pub mod face_registry;
pub mod pipeline;
pub mod video;
pub mod web;
