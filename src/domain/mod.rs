pub mod boards;
pub mod features;
pub mod models;
pub mod settings;
pub mod timestamp;
