//! Registration runs wired through the public API.

mod registration_test;
