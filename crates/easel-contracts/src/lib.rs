pub mod assets;
pub mod requests;
pub mod settings;
pub mod sources;
pub mod targets;
