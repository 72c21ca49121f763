pub mod assignment;
pub mod cooldown;
pub mod dispatcher;
pub mod gateway;
pub mod lock;
pub mod peak;
pub mod queue;
pub mod scoring;
pub mod snapshot;
