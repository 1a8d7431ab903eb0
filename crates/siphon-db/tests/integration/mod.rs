pub mod common;
mod result_store_tests;
mod scheduler_tests;
