pub mod download;
pub mod player;
pub mod queue;
pub mod voice;
