pub mod dispatcher;
pub mod geo_filter;
pub mod notifier;
pub mod retry_queue;
pub mod token_selector;
