// Detection-and-streaming pipeline

pub mod broadcaster;
pub mod detection;
mod glyphs;
pub mod identity;
pub mod orchestrator;
pub mod overlay;
pub mod scheduler;
pub mod types;
