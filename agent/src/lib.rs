pub mod config;
pub mod desired;
pub mod device;
pub mod errors;
pub mod link;
pub mod methods;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod scheduler;
pub mod session;
