//! Setup for the running application: logging and service wiring.
pub mod logging;
