pub mod broadcaster;
pub mod broadcaster_config;
pub mod buffer_pool;
pub mod credit_pool;
pub mod flow_controller;
pub mod group_lifecycle;
