pub mod anomaly;
pub mod archive;
pub mod fomod;
pub mod installer;
pub mod mod_organizer;
pub mod mod_pipeline;
pub mod moddb;
pub mod repos;
