pub mod api;
pub mod job;
pub mod media;
pub mod overlay;
pub mod style;
pub mod transcript;
