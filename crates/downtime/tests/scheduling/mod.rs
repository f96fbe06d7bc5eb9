/// Due-time index and scheduler loop tests
pub mod dispatch_tests;
pub mod reconcile_tests;
