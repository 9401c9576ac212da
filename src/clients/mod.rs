pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod dead_letter;
pub mod fcm;
pub mod gateway;
pub mod health;
pub mod quota;
pub mod rbmq;
pub mod recipients;
pub mod redis;
pub mod store;
