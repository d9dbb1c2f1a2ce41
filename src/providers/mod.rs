pub mod fetch;
pub mod realtime;
