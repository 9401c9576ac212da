pub mod circuit_breaker;
pub mod dead_letter;
pub mod dispatch;
pub mod fcm;
pub mod health;
pub mod message;
pub mod quota;
pub mod recipient;
pub mod retry;
pub mod validation;
