//! Release lookup and installation against a mock release service.

mod install_test;
mod lookup_test;
