pub mod discovery;
pub mod receiver;
pub mod receiver_config;
pub mod receiver_events;
pub mod stream_consumer;
pub mod sync_state_machine;
