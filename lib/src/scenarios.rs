//! End-to-end scenario tests, exercising the scanner, cleanup engine,
//! deploy primitive and apply state machine together through
//! [`crate::fixture::Fixture`]. Test-only: not part of the public API.
