//! Cross-component integration tests.

mod pipeline_tests;
