//! This is the library module that provides the routing core of the interception gateway:
//! RoutingKey, Descriptor, RouteCache, Classifier, Router and associated functions
//!
//! Captured TCP segments are classified, keyed by their destination endpoint
//! and either handed to the connection handler that owns that endpoint
//! or parked in a delay buffer until such a handler registers

pub mod apis;
pub mod router;

pub use apis::*;
pub use router::*;
