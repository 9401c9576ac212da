mod support;

mod dispatcher_tests;
mod redis_store_tests;
mod retry_queue_tests;
