pub mod circuit_breaker;
pub mod database;
pub mod health;
pub mod memory;
pub mod proxy;
pub mod rbmq;
pub mod redis;
