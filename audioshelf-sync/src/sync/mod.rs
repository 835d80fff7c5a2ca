pub mod backoff;
pub mod conflict;
pub mod events;
pub mod images;
pub mod orchestrator;
pub mod palette;
pub mod puller;
pub mod push;
pub mod realtime;
pub mod records;
pub mod status;
pub mod store;
