//! Cross-module tests for the training pipeline
//!
//! Unit tests live next to the code they cover; the tests here drive the
//! trainer end to end over seeded in-memory data and a tiny network.

// Test modules
pub mod integration_tests;


pub use mock_data::{create_mock_samples, EmptySource};
pub use test_utils::{create_test_config, create_test_device, create_test_trainer, tiny_system};
